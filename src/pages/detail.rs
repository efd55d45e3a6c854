use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use log::{log, Level};

use crate::{
    app::CampusContext,
    error::{CampusError, CampusResult},
    schema::{
        db::{Comment, Complaint, Note, Status},
        query::{CollectionPath, Direction, DocumentPath, Query, CREATED_AT},
    },
    store::encode,
    sync::{LiveView, Outcome, Subscription, Tentative, ViewStatus},
    utils::non_blank,
};

/// One complaint with its comment thread and, for admins, internal notes.
pub struct DetailPage {
    ctx: CampusContext,
    id: String,
    complaint: LiveView<Complaint>,
    comments: LiveView<Comment>,
    notes: Option<LiveView<Note>>,
    _subscriptions: Vec<Subscription>,
}

impl DetailPage {
    /// The notes channel is only opened when the signed-in user is an admin.
    pub fn mount(ctx: &CampusContext, id: &str) -> Self {
        let (complaint, complaint_sub) = LiveView::bind(
            &ctx.subscriptions,
            Query::document(DocumentPath::complaint(id)),
        );
        let (comments, comments_sub) = LiveView::bind(
            &ctx.subscriptions,
            Query::collection(CollectionPath::comments(id))
                .order_by(CREATED_AT, Direction::Ascending),
        );
        let mut subscriptions = vec![complaint_sub, comments_sub];

        let is_admin = ctx.session.current().is_some_and(|user| user.is_admin());
        let notes = is_admin.then(|| {
            let (notes, notes_sub) = LiveView::bind(
                &ctx.subscriptions,
                Query::collection(CollectionPath::notes(id))
                    .order_by(CREATED_AT, Direction::Ascending),
            );
            subscriptions.push(notes_sub);
            notes
        });

        Self {
            ctx: ctx.clone(),
            id: id.to_string(),
            complaint,
            comments,
            notes,
            _subscriptions: subscriptions,
        }
    }

    pub fn complaint_view(&self) -> &LiveView<Complaint> {
        &self.complaint
    }

    pub fn comments_view(&self) -> &LiveView<Comment> {
        &self.comments
    }

    pub fn notes_view(&self) -> Option<&LiveView<Note>> {
        self.notes.as_ref()
    }

    /// `None` while loading or when the complaint does not exist.
    pub fn complaint(&self) -> Option<Complaint> {
        self.complaint.items().into_iter().next()
    }

    pub fn status(&self) -> ViewStatus {
        self.complaint.status()
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.comments.items()
    }

    /// Internal notes. Non-admins are refused without touching the store.
    pub fn notes(&self) -> CampusResult<Vec<Note>> {
        self.ctx.session.require_admin()?;
        Ok(self
            .notes
            .as_ref()
            .map(|notes| notes.items())
            .unwrap_or_default())
    }

    pub async fn add_comment(&self, text: &str) -> CampusResult<Option<String>> {
        let user = self.ctx.session.require_user()?;
        let text = non_blank(text)
            .ok_or_else(|| CampusError::ValidationFailed("Comment cannot be empty".into()))?
            .to_string();

        let comment = Comment {
            text,
            created_by: user.id.clone(),
            ..Default::default()
        };
        let data = encode(&comment).map_err(CampusError::from_write)?;
        let store = self.ctx.store.clone();
        let path = CollectionPath::comments(&self.id);

        self.ctx
            .coordinator
            .mutate(
                &self.comments,
                |c| {
                    Tentative::Draft(c.add_draft(|temp_id| Comment {
                        id: temp_id.to_string(),
                        created_at: Some(Utc::now()),
                        pending: true,
                        ..comment.clone()
                    }))
                },
                async move {
                    store
                        .create(&path, data)
                        .await
                        .map(Some)
                        .map_err(CampusError::from_write)
                },
                self.comments.notifier(),
            )
            .await
    }

    /// Allowed for the comment's author and for admins. Removing a comment
    /// that is still a local draft never reaches the store.
    pub async fn delete_comment(&self, comment_id: &str) -> CampusResult<()> {
        let user = self.ctx.session.require_user()?;
        let comment = self
            .comments
            .get(comment_id)
            .ok_or_else(|| CampusError::NotFound("Comment".into()))?;
        if comment.created_by != user.id && !user.is_admin() {
            return Err(CampusError::PermissionDenied(format!(
                "{} cannot delete comment {comment_id}",
                user.id
            )));
        }

        let confirmed = match self.comments.read(|c| c.draft_confirmation(comment_id)) {
            Some(None) => {
                log!(Level::Debug, "Discarding unsent comment {comment_id}");
                self.comments.update(|c| c.discard_draft(comment_id));
                return Ok(());
            }
            Some(Some(id)) => {
                self.comments.update(|c| c.discard_draft(comment_id));
                id
            }
            None => comment_id.to_string(),
        };

        let store = self.ctx.store.clone();
        let path = CollectionPath::comments(&self.id).doc(&confirmed);
        self.ctx
            .coordinator
            .mutate(
                &self.comments,
                |c| {
                    c.hide(&confirmed);
                    Tentative::Hidden(confirmed.clone())
                },
                async move {
                    store
                        .delete(&path)
                        .await
                        .map(|()| None::<String>)
                        .map_err(CampusError::from_write)
                },
                self.comments.notifier(),
            )
            .await
            .map(|_| ())
    }

    pub async fn add_note(&self, text: &str) -> CampusResult<Option<String>> {
        let user = self.ctx.session.require_admin()?;
        let text = non_blank(text)
            .ok_or_else(|| CampusError::ValidationFailed("Note cannot be empty".into()))?
            .to_string();

        let note = Note {
            text,
            created_by: user.id,
            ..Default::default()
        };
        let data = encode(&note).map_err(CampusError::from_write)?;
        let store = self.ctx.store.clone();
        let path = CollectionPath::notes(&self.id);
        let remote = async move {
            store
                .create(&path, data)
                .await
                .map(Some)
                .map_err(CampusError::from_write)
        };

        match &self.notes {
            Some(notes) => {
                self.ctx
                    .coordinator
                    .mutate(
                        notes,
                        |c| {
                            Tentative::Draft(c.add_draft(|temp_id| Note {
                                id: temp_id.to_string(),
                                created_at: Some(Utc::now()),
                                ..note.clone()
                            }))
                        },
                        remote,
                        notes.notifier(),
                    )
                    .await
            }
            None => remote.await,
        }
    }

    pub async fn set_status(&self, status: Status) -> CampusResult<Outcome<Status>> {
        super::change_status(&self.ctx, &self.complaint, &self.id, status).await
    }

    /// Display name of a user, fetched once per session.
    pub async fn display_name(&self, uid: &str) -> String {
        self.ctx
            .users
            .display_name(self.ctx.store.as_ref(), uid)
            .await
    }

    /// Display names for everyone who has commented so far.
    pub async fn comment_authors(&self) -> BTreeMap<String, String> {
        let uids: BTreeSet<String> = self
            .comments()
            .into_iter()
            .map(|c| c.created_by)
            .filter(|uid| !uid.is_empty())
            .collect();
        let mut names = BTreeMap::new();
        for uid in uids {
            let name = self.display_name(&uid).await;
            names.insert(uid, name);
        }
        names
    }
}
