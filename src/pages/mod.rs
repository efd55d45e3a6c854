//! Headless page models. Each page owns its subscriptions and cancels them
//! when dropped; its views are read-only from the outside.

pub mod admin;
pub mod detail;
pub mod feed;
pub mod my_complaints;
pub mod profile;
pub mod submit;

use serde_json::{Map, Value};

use crate::{
    app::CampusContext,
    error::{CampusError, CampusResult},
    schema::{
        db::{Complaint, Status},
        query::{CollectionPath, Direction, DocumentPath, Query, CREATED_AT},
    },
    sync::{Field, LiveView, Outcome, Toggle},
};

impl Toggle for Complaint {
    fn has_member(&self, member: &str) -> bool {
        self.upvoted_by(member)
    }

    fn set_member(&mut self, member: &str, present: bool) {
        if present {
            self.upvotes.insert(member.to_string());
        } else {
            self.upvotes.remove(member);
        }
    }
}

const STATUS: Field<Complaint, Status> = Field {
    get: |c| c.status,
    set: |c, status| c.status = status,
};

/// All complaints, newest first.
pub(crate) fn all_complaints() -> Query {
    Query::collection(CollectionPath::complaints()).order_by(CREATED_AT, Direction::Descending)
}

/// Admin-only status change, serialized per complaint.
pub(crate) async fn change_status(
    ctx: &CampusContext,
    view: &LiveView<Complaint>,
    id: &str,
    status: Status,
) -> CampusResult<Outcome<Status>> {
    ctx.session.require_admin()?;
    let store = ctx.store.clone();
    let path = DocumentPath::complaint(id);

    ctx.coordinator
        .assign(
            view,
            id,
            "status",
            status,
            STATUS,
            move |status: Status| {
                let (store, path) = (store.clone(), path.clone());
                async move {
                    let mut fields = Map::new();
                    fields.insert("status".into(), Value::from(status.as_str()));
                    store
                        .update(&path, fields)
                        .await
                        .map_err(CampusError::from_write)
                }
            },
            view.notifier(),
        )
        .await
}
