use crate::{
    app::CampusContext,
    error::{CampusError, CampusResult},
    schema::{db::Complaint, query::DocumentPath},
    sync::{LiveView, Outcome, Subscription, ViewStatus},
};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub complaint: Complaint,
    pub upvotes: usize,
    pub upvoted_by_me: bool,
}

/// Every complaint, newest first, with upvoting.
pub struct FeedPage {
    ctx: CampusContext,
    complaints: LiveView<Complaint>,
    _subscription: Subscription,
}

impl FeedPage {
    pub fn mount(ctx: &CampusContext) -> Self {
        let (complaints, subscription) =
            LiveView::bind(&ctx.subscriptions, super::all_complaints());
        Self {
            ctx: ctx.clone(),
            complaints,
            _subscription: subscription,
        }
    }

    pub fn view(&self) -> &LiveView<Complaint> {
        &self.complaints
    }

    pub fn status(&self) -> ViewStatus {
        self.complaints.status()
    }

    pub fn items(&self) -> Vec<FeedItem> {
        let me = self.ctx.session.current().map(|user| user.id);
        self.complaints
            .items()
            .into_iter()
            .map(|complaint| FeedItem {
                upvotes: complaint.upvotes.len(),
                upvoted_by_me: me.as_deref().is_some_and(|uid| complaint.upvoted_by(uid)),
                complaint,
            })
            .collect()
    }

    /// Adds or removes the signed-in user's upvote.
    pub async fn toggle_upvote(&self, id: &str) -> CampusResult<Outcome<bool>> {
        let user = self.ctx.session.require_user()?;
        let store = self.ctx.store.clone();
        let path = DocumentPath::complaint(id);
        let uid = user.id.clone();

        self.ctx
            .coordinator
            .toggle(
                &self.complaints,
                id,
                &user.id,
                move |present| {
                    let (store, path, uid) = (store.clone(), path.clone(), uid.clone());
                    async move {
                        let written = if present {
                            store.add_to_set(&path, "upvotes", &uid).await
                        } else {
                            store.remove_from_set(&path, "upvotes", &uid).await
                        };
                        written.map_err(CampusError::from_write)
                    }
                },
                self.complaints.notifier(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        blob::MemoryBlobStore,
        identity::{Identity, TokenVerifier},
        schema::query::CollectionPath,
        store::{encode, memory::MemoryStore, DocumentStore},
    };

    async fn context() -> (Arc<MemoryStore>, CampusContext) {
        let store = Arc::new(MemoryStore::new());
        let ctx = CampusContext::new(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            TokenVerifier::new(None, None).with_security(false),
        );
        let identity = Identity {
            id: "u1".into(),
            display_name: "Student".into(),
            email: "u1@campus.edu".into(),
            avatar: None,
        };
        ctx.session.sign_in(identity, store.as_ref()).await.unwrap();
        (store, ctx)
    }

    #[tokio::test]
    async fn upvote_round_trip() {
        let (store, ctx) = context().await;
        let id = store
            .create(&CollectionPath::complaints(), encode(&Complaint::default()).unwrap())
            .await
            .unwrap();
        let feed = FeedPage::mount(&ctx);
        feed.view().wait_until(|c| !c.authoritative().is_empty()).await;

        assert_eq!(feed.toggle_upvote(&id).await, Ok(Outcome::Written(true)));
        feed.view()
            .wait_until(|c| c.authoritative()[0].upvoted_by("u1") && !c.has_pending_changes())
            .await;
        let item = &feed.items()[0];
        assert!(item.upvoted_by_me);
        assert_eq!(item.upvotes, 1);

        assert_eq!(feed.toggle_upvote(&id).await, Ok(Outcome::Written(false)));
        feed.view()
            .wait_until(|c| !c.authoritative()[0].upvoted_by("u1") && !c.has_pending_changes())
            .await;
        assert_eq!(feed.items()[0].upvotes, 0);
    }

    #[tokio::test]
    async fn signed_out_upvote_is_rejected_locally() {
        let (_, ctx) = context().await;
        ctx.sign_out();
        let feed = FeedPage::mount(&ctx);
        assert_eq!(
            feed.toggle_upvote("anything").await,
            Err(CampusError::AuthRequired)
        );
    }
}
