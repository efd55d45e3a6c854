//! Optimistic mutations.
//!
//! Every user action applies a tentative change to the view first, then
//! issues the remote write. Success leaves reconciliation to the next
//! snapshot; failure rolls the tentative change back and reports a message.

use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{log, Level};

use super::view::{LiveCollection, LiveView};
use crate::{
    error::{CampusError, CampusResult},
    schema::db::Record,
};

/// What a local apply did, so it can be confirmed or undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tentative {
    /// A draft entry under a temporary id.
    Draft(String),
    /// An existing entry hidden from the view.
    Hidden(String),
    /// A field overlay on an existing entry.
    Patched { id: String, key: String },
    Untracked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V> {
    /// This call performed the write(s); carries the last value written.
    Written(V),
    /// Another call already has a write in flight and will pick this one up.
    Queued,
}

/// Sets-membership of one user in one record, e.g. the upvote set.
pub trait Toggle: Record {
    fn has_member(&self, member: &str) -> bool;
    fn set_member(&mut self, member: &str, present: bool);
}

/// Accessors for a single-valued field written through [`MutationCoordinator::assign`].
pub struct Field<T, V> {
    pub get: fn(&T) -> V,
    pub set: fn(&mut T, V),
}

impl<T, V> Clone for Field<T, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, V> Copy for Field<T, V> {}

type Slot = (String, String);

#[derive(Clone, Default)]
pub struct MutationCoordinator {
    /// Queued toggle requests per (record, member) while one is in flight.
    toggles: Arc<Mutex<HashMap<Slot, usize>>>,
    /// Pending value per (record, field) while a write is in flight.
    assignments: Arc<Mutex<HashMap<Slot, Option<Box<dyn Any + Send>>>>>,
}

fn lock<V>(map: &Mutex<V>) -> MutexGuard<'_, V> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn confirm<T: Record>(view: &LiveView<T>, tentative: &Tentative, id: Option<String>) {
    view.update(|c| match tentative {
        Tentative::Draft(temp_id) => c.confirm_draft(temp_id, id),
        Tentative::Hidden(id) => c.ack_hidden(id),
        Tentative::Patched { id, key } => c.ack_patch(id, key),
        Tentative::Untracked => {}
    });
}

fn roll_back<T: Record>(view: &LiveView<T>, tentative: &Tentative) {
    view.update(|c| match tentative {
        Tentative::Draft(temp_id) => c.discard_draft(temp_id),
        Tentative::Hidden(id) => c.unhide(id),
        Tentative::Patched { id, key } => c.drop_patch(id, key),
        Tentative::Untracked => {}
    });
}

impl MutationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `local_apply` to the view, then awaits `remote`.
    ///
    /// `remote` resolves to the backend id of a created document, if any. On
    /// failure the tentative change is undone and `on_error` gets the
    /// message. The write is never retried.
    pub async fn mutate<T, L, Fut, E>(
        &self,
        view: &LiveView<T>,
        local_apply: L,
        remote: Fut,
        on_error: E,
    ) -> CampusResult<Option<String>>
    where
        T: Record,
        L: FnOnce(&mut LiveCollection<T>) -> Tentative,
        Fut: Future<Output = CampusResult<Option<String>>>,
        E: FnOnce(String),
    {
        let tentative = view.update(local_apply);
        match remote.await {
            Ok(id) => {
                confirm(view, &tentative, id.clone());
                Ok(id)
            }
            Err(err) => {
                log!(Level::Warn, "Write failed, reverting {tentative:?}: {err}");
                roll_back(view, &tentative);
                on_error(err.user_message());
                Err(err)
            }
        }
    }

    /// Flips `member` in the record's set, evaluated against the settled
    /// state (last snapshot plus acknowledged writes).
    ///
    /// At most one write per (record, member) is in flight. A request made
    /// meanwhile returns [`Outcome::Queued`] and is performed by the caller
    /// that owns the in-flight write, re-evaluated when it is dequeued.
    pub async fn toggle<T, R, Fut, E>(
        &self,
        view: &LiveView<T>,
        id: &str,
        member: &str,
        remote: R,
        on_error: E,
    ) -> CampusResult<Outcome<bool>>
    where
        T: Toggle,
        R: Fn(bool) -> Fut,
        Fut: Future<Output = CampusResult<()>>,
        E: Fn(String),
    {
        let slot = (id.to_string(), member.to_string());
        {
            let mut toggles = lock(&self.toggles);
            if let Some(queued) = toggles.get_mut(&slot) {
                *queued += 1;
                log!(Level::Debug, "Queued toggle of {member} on {id}");
                return Ok(Outcome::Queued);
            }
            toggles.insert(slot.clone(), 0);
        }

        let key = format!("member:{member}");
        let result = loop {
            let result = self.toggle_once(view, id, member, &key, &remote, &on_error).await;

            let mut toggles = lock(&self.toggles);
            match toggles.get_mut(&slot) {
                Some(queued) if *queued > 0 => *queued -= 1,
                _ => {
                    toggles.remove(&slot);
                    break result;
                }
            }
        };
        result.map(Outcome::Written)
    }

    async fn toggle_once<T, R, Fut, E>(
        &self,
        view: &LiveView<T>,
        id: &str,
        member: &str,
        key: &str,
        remote: &R,
        on_error: &E,
    ) -> CampusResult<bool>
    where
        T: Toggle,
        R: Fn(bool) -> Fut,
        Fut: Future<Output = CampusResult<()>>,
        E: Fn(String),
    {
        let Some(settled) = view.read(|c| c.settled(id)) else {
            return Err(CampusError::NotFound(id.to_string()));
        };
        let present = !settled.has_member(member);

        let owned = member.to_string();
        let check = member.to_string();
        view.update(|c| {
            c.patch(
                id,
                key,
                move |item: &mut T| item.set_member(&owned, present),
                move |a: &T, b: &T| a.has_member(&check) == b.has_member(&check),
            )
        });

        match remote(present).await {
            Ok(()) => {
                view.update(|c| c.ack_patch(id, key));
                Ok(present)
            }
            Err(err) => {
                log!(Level::Warn, "Toggle of {member} on {id} failed: {err}");
                view.update(|c| c.drop_patch(id, key));
                on_error(err.user_message());
                Err(err)
            }
        }
    }

    /// Sets a single-valued field optimistically, serialized per
    /// (record, field).
    ///
    /// The view shows `value` at once. While a write is in flight, further
    /// requests only replace the pending value (last request wins) and
    /// return [`Outcome::Queued`]; the in-flight caller writes it next.
    #[allow(clippy::too_many_arguments)]
    pub async fn assign<T, V, R, Fut, E>(
        &self,
        view: &LiveView<T>,
        id: &str,
        key: &str,
        value: V,
        field: Field<T, V>,
        remote: R,
        on_error: E,
    ) -> CampusResult<Outcome<V>>
    where
        T: Record,
        V: Clone + PartialEq + Send + Sync + 'static,
        R: Fn(V) -> Fut,
        Fut: Future<Output = CampusResult<()>>,
        E: Fn(String),
    {
        let slot = (id.to_string(), key.to_string());
        overlay(view, id, key, value.clone(), field);
        {
            let mut assignments = lock(&self.assignments);
            if let Some(pending) = assignments.get_mut(&slot) {
                *pending = Some(Box::new(value));
                log!(Level::Debug, "Collapsed pending {key} write on {id}");
                return Ok(Outcome::Queued);
            }
            assignments.insert(slot.clone(), None);
        }

        let mut value = value;
        loop {
            let result = remote(value.clone()).await;

            let next = {
                let mut assignments = lock(&self.assignments);
                let next = assignments
                    .get_mut(&slot)
                    .and_then(Option::take)
                    .and_then(|pending| pending.downcast::<V>().ok());
                if next.is_none() {
                    assignments.remove(&slot);
                }
                next
            };

            match (result, next) {
                (Err(err), Some(next)) => {
                    log!(Level::Warn, "Superseded {key} write on {id} failed: {err}");
                    value = *next;
                }
                (Ok(()), Some(next)) => value = *next,
                (Ok(()), None) => {
                    view.update(|c| c.ack_patch(id, key));
                    return Ok(Outcome::Written(value));
                }
                (Err(err), None) => {
                    log!(Level::Warn, "Writing {key} on {id} failed: {err}");
                    view.update(|c| c.drop_patch(id, key));
                    on_error(err.user_message());
                    return Err(err);
                }
            }
        }
    }
}

fn overlay<T, V>(view: &LiveView<T>, id: &str, key: &str, value: V, field: Field<T, V>)
where
    T: Record,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    view.update(|c| {
        c.patch(
            id,
            key,
            move |item: &mut T| (field.set)(item, value.clone()),
            move |a: &T, b: &T| (field.get)(a) == (field.get)(b),
        )
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::schema::db::{Complaint, Status};

    async fn accept(_: bool) -> CampusResult<()> {
        Ok(())
    }

    const STATUS: Field<Complaint, Status> = Field {
        get: |c| c.status,
        set: |c, v| c.status = v,
    };

    fn view_with(items: Vec<Complaint>) -> LiveView<Complaint> {
        let view = LiveView::new();
        view.update(|c| c.apply_snapshot(items, 1));
        view
    }

    fn complaint(id: &str) -> Complaint {
        Complaint {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_draft_is_rolled_back_with_message() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();

        let result = coordinator
            .mutate(
                &view,
                |c| Tentative::Draft(c.add_draft(|id| complaint(id))),
                async { Err::<Option<String>, _>(CampusError::WriteFailed("offline".into())) },
                move |m| sink.lock().unwrap().push(m),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(view.items().len(), 1);
        assert_eq!(*messages.lock().unwrap(), vec!["Failed to save changes"]);
    }

    #[tokio::test]
    async fn confirmed_draft_waits_for_snapshot() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);

        let id = coordinator
            .mutate(
                &view,
                |c| Tentative::Draft(c.add_draft(|id| complaint(id))),
                async { Ok::<_, CampusError>(Some("b".to_string())) },
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("b"));
        assert_eq!(view.items().len(), 2);

        view.update(|c| c.apply_snapshot(vec![complaint("a"), complaint("b")], 2));
        let ids: Vec<_> = view.items().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn concurrent_toggles_are_serialized() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);
        let gate = Arc::new(Semaphore::new(0));
        let writes = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let (coordinator, view, gate, writes) =
                (coordinator.clone(), view.clone(), gate.clone(), writes.clone());
            tokio::spawn(async move {
                coordinator
                    .toggle(
                        &view,
                        "a",
                        "u1",
                        |present| {
                            let (gate, writes) = (gate.clone(), writes.clone());
                            async move {
                                gate.acquire().await.unwrap().forget();
                                writes.lock().unwrap().push(present);
                                Ok::<(), CampusError>(())
                            }
                        },
                        |_| {},
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(view.get("a").unwrap().upvoted_by("u1"));

        let second = coordinator
            .toggle(&view, "a", "u1", accept, |_| {})
            .await
            .unwrap();
        assert_eq!(second, Outcome::Queued);

        gate.add_permits(2);
        assert_eq!(first.await.unwrap().unwrap(), Outcome::Written(false));
        assert_eq!(*writes.lock().unwrap(), vec![true, false]);

        view.update(|c| c.apply_snapshot(vec![complaint("a")], 2));
        assert!(!view.get("a").unwrap().upvoted_by("u1"));
        assert!(!view.read(|c| c.has_pending_changes()));
    }

    #[tokio::test]
    async fn toggle_is_evaluated_against_settled_state() {
        let coordinator = MutationCoordinator::new();
        let mut upvoted = complaint("a");
        upvoted.upvotes.insert("u1".into());
        let view = view_with(vec![upvoted]);

        let outcome = coordinator
            .toggle(&view, "a", "u1", accept, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Written(false));
        // Acknowledged but not yet in a snapshot: the next toggle re-adds.
        let outcome = coordinator
            .toggle(&view, "a", "u1", accept, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Written(true));
    }

    #[tokio::test]
    async fn failed_toggle_reverts() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);
        let result = coordinator
            .toggle(
                &view,
                "a",
                "u1",
                |_| async { Err::<(), _>(CampusError::PermissionDenied("upvotes".into())) },
                |_| {},
            )
            .await;
        assert!(result.is_err());
        assert!(!view.get("a").unwrap().upvoted_by("u1"));
    }

    #[tokio::test]
    async fn status_requests_collapse_to_last() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);
        let gate = Arc::new(Semaphore::new(0));
        let writes = Arc::new(Mutex::new(Vec::new()));

        let remote = {
            let (gate, writes) = (gate.clone(), writes.clone());
            move |status: Status| {
                let (gate, writes) = (gate.clone(), writes.clone());
                async move {
                    gate.acquire().await.unwrap().forget();
                    writes.lock().unwrap().push(status);
                    Ok::<(), CampusError>(())
                }
            }
        };

        let first = {
            let (coordinator, view, remote) = (coordinator.clone(), view.clone(), remote.clone());
            tokio::spawn(async move {
                coordinator
                    .assign(&view, "a", "status", Status::InProgress, STATUS, remote, |_| {})
                    .await
            })
        };
        tokio::task::yield_now().await;

        for status in [Status::Resolved, Status::Closed] {
            let outcome = coordinator
                .assign(&view, "a", "status", status, STATUS, remote.clone(), |_| {})
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Queued);
        }
        assert_eq!(view.get("a").unwrap().status, Status::Closed);

        gate.add_permits(2);
        assert_eq!(
            first.await.unwrap().unwrap(),
            Outcome::Written(Status::Closed)
        );
        assert_eq!(
            *writes.lock().unwrap(),
            vec![Status::InProgress, Status::Closed]
        );
    }

    #[tokio::test]
    async fn only_the_final_status_failure_is_reported() {
        let coordinator = MutationCoordinator::new();
        let view = view_with(vec![complaint("a")]);
        let gate = Arc::new(Semaphore::new(0));
        let messages = Arc::new(Mutex::new(Vec::new()));

        let remote = {
            let gate = gate.clone();
            move |status: Status| {
                let gate = gate.clone();
                async move {
                    gate.acquire().await.unwrap().forget();
                    Err::<(), _>(CampusError::WriteFailed(status.to_string()))
                }
            }
        };
        let report = {
            let messages = messages.clone();
            move |m: String| messages.lock().unwrap().push(m)
        };

        let first = {
            let (coordinator, view, remote, report) =
                (coordinator.clone(), view.clone(), remote.clone(), report.clone());
            tokio::spawn(async move {
                coordinator
                    .assign(&view, "a", "status", Status::InProgress, STATUS, remote, report)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let queued = coordinator
            .assign(&view, "a", "status", Status::Closed, STATUS, remote, report)
            .await
            .unwrap();
        assert_eq!(queued, Outcome::Queued);

        gate.add_permits(2);
        assert_eq!(
            first.await.unwrap(),
            Err(CampusError::WriteFailed("closed".into()))
        );
        assert_eq!(*messages.lock().unwrap(), vec!["Failed to save changes"]);
        assert_eq!(view.get("a").unwrap().status, Status::Open);
        assert!(!view.read(|c| c.has_pending_changes()));
    }
}
