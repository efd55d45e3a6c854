//! Local view state for one live collection.
//!
//! The authoritative part is always exactly the last delivered snapshot.
//! Optimistic state sits beside it as three overlays that the mutation
//! coordinator manages: drafts (local additions), hidden ids (local
//! removals) and field patches (local edits). Nothing else writes here.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use chrono::Utc;
use log::{log, Level};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::subscription::{Snapshot, Subscription, SubscriptionManager};
use crate::{error::CampusError, schema::db::Record, schema::query::Query};

pub const DRAFT_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, PartialEq)]
pub enum ViewStatus {
    /// No snapshot yet.
    Loading,
    Ready,
    /// The channel failed; the view shows nothing until remounted.
    Failed(CampusError),
}

struct Draft<T> {
    temp_id: String,
    item: T,
    confirmed_id: Option<String>,
}

struct Hidden {
    acked: bool,
}

type PatchFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type SameFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct Patch<T> {
    apply: PatchFn<T>,
    /// Whether two items agree on the patched field.
    same: SameFn<T>,
    acked: bool,
    /// Authoritative item when the backend acknowledged the write.
    base: Option<T>,
}

impl<T: Clone> Patch<T> {
    fn reflected_by(&self, item: &T) -> bool {
        let mut expected = item.clone();
        (self.apply)(&mut expected);
        (self.same)(item, &expected)
    }

    /// A snapshot whose field moved away from the acknowledged base without
    /// landing on our value carries someone else's later write.
    fn overtaken_by(&self, item: &T) -> bool {
        self.base.as_ref().is_some_and(|base| !(self.same)(base, item))
    }
}

pub struct LiveCollection<T> {
    snapshot: Vec<T>,
    generation: u64,
    status: ViewStatus,
    drafts: Vec<Draft<T>>,
    hidden: HashMap<String, Hidden>,
    patches: BTreeMap<(String, String), Patch<T>>,
    notice: Option<String>,
}

impl<T: Record> Default for LiveCollection<T> {
    fn default() -> Self {
        Self {
            snapshot: Vec::new(),
            generation: 0,
            status: ViewStatus::Loading,
            drafts: Vec::new(),
            hidden: HashMap::new(),
            patches: BTreeMap::new(),
            notice: None,
        }
    }
}

impl<T: Record> LiveCollection<T> {
    pub fn status(&self) -> &ViewStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The last delivered snapshot, untouched by optimistic state.
    pub fn authoritative(&self) -> &[T] {
        &self.snapshot
    }

    /// Dismissible message from the last failed write.
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    fn authoritative_item(&self, id: &str) -> Option<&T> {
        self.snapshot.iter().find(|item| item.id() == id)
    }

    fn patched(&self, item: &T, acked_only: bool) -> T {
        let mut item = item.clone();
        for ((id, _), patch) in &self.patches {
            if id == item.id() && (!acked_only || patch.acked) {
                (patch.apply)(&mut item);
            }
        }
        item
    }

    /// What the user sees: snapshot minus hidden entries, with patches
    /// applied, followed by drafts the snapshot does not contain yet.
    pub fn items(&self) -> Vec<T> {
        if matches!(self.status, ViewStatus::Failed(_)) {
            return Vec::new();
        }
        let mut items: Vec<T> = self
            .snapshot
            .iter()
            .filter(|item| !self.hidden.contains_key(item.id()))
            .map(|item| self.patched(item, false))
            .collect();
        items.extend(
            self.drafts
                .iter()
                .filter(|d| !self.hidden.contains_key(&d.temp_id))
                .map(|d| d.item.clone()),
        );
        items
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items().into_iter().find(|item| item.id() == id)
    }

    /// The authoritative item plus writes the backend has acknowledged but
    /// no snapshot has reflected yet. Toggles are evaluated against this.
    pub fn settled(&self, id: &str) -> Option<T> {
        self.authoritative_item(id)
            .map(|item| self.patched(item, true))
    }

    pub fn is_draft(&self, id: &str) -> bool {
        self.drafts.iter().any(|d| d.temp_id == id)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.drafts.is_empty() || !self.hidden.is_empty() || !self.patches.is_empty()
    }

    pub(crate) fn apply_snapshot(&mut self, items: Vec<T>, generation: u64) {
        self.snapshot = items;
        self.generation = generation;
        self.status = ViewStatus::Ready;

        let snapshot = &self.snapshot;
        let contains = |id: &str| snapshot.iter().any(|item| item.id() == id);

        self.drafts.retain(|d| match &d.confirmed_id {
            Some(id) => !contains(id),
            None => true,
        });
        self.hidden.retain(|id, h| !(h.acked && !contains(id)));
        self.patches.retain(|(id, key), patch| {
            if !patch.acked {
                return true;
            }
            match snapshot.iter().find(|item| item.id() == id) {
                Some(item) if patch.reflected_by(item) => false,
                Some(item) if patch.overtaken_by(item) => {
                    log!(Level::Debug, "Dropping overtaken {key} overlay on {id}");
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }

    pub(crate) fn fail(&mut self, err: CampusError) {
        self.snapshot.clear();
        self.drafts.clear();
        self.hidden.clear();
        self.patches.clear();
        self.status = ViewStatus::Failed(err);
    }

    pub(crate) fn add_draft(&mut self, mut build: impl FnMut(&str) -> T) -> String {
        let temp_id = format!(
            "{DRAFT_PREFIX}{}-{:04x}",
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u16>()
        );
        let item = build(&temp_id);
        self.drafts.push(Draft {
            temp_id: temp_id.clone(),
            item,
            confirmed_id: None,
        });
        temp_id
    }

    pub(crate) fn confirm_draft(&mut self, temp_id: &str, id: Option<String>) {
        let in_snapshot = id
            .as_deref()
            .is_some_and(|id| self.authoritative_item(id).is_some());
        match id {
            Some(id) if !in_snapshot => {
                if let Some(draft) = self.drafts.iter_mut().find(|d| d.temp_id == temp_id) {
                    draft.confirmed_id = Some(id);
                }
            }
            _ => self.discard_draft(temp_id),
        }
    }

    pub(crate) fn discard_draft(&mut self, temp_id: &str) {
        self.drafts.retain(|d| d.temp_id != temp_id);
        self.hidden.remove(temp_id);
    }

    /// Backend id of a draft, once its write has been acknowledged.
    pub(crate) fn draft_confirmation(&self, temp_id: &str) -> Option<Option<String>> {
        self.drafts
            .iter()
            .find(|d| d.temp_id == temp_id)
            .map(|d| d.confirmed_id.clone())
    }

    pub(crate) fn hide(&mut self, id: &str) {
        self.hidden.insert(id.to_string(), Hidden { acked: false });
    }

    /// The entry stays hidden until a snapshot without it arrives, even if
    /// no snapshot has shown it yet.
    pub(crate) fn ack_hidden(&mut self, id: &str) {
        if let Some(h) = self.hidden.get_mut(id) {
            h.acked = true;
        }
    }

    pub(crate) fn unhide(&mut self, id: &str) {
        self.hidden.remove(id);
    }

    pub(crate) fn patch(
        &mut self,
        id: &str,
        key: &str,
        apply: impl Fn(&mut T) + Send + Sync + 'static,
        same: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) {
        self.patches.insert(
            (id.to_string(), key.to_string()),
            Patch {
                apply: Box::new(apply),
                same: Box::new(same),
                acked: false,
                base: None,
            },
        );
    }

    pub(crate) fn ack_patch(&mut self, id: &str, key: &str) {
        let slot = (id.to_string(), key.to_string());
        let base = self.authoritative_item(id).cloned();
        let Some(patch) = self.patches.get_mut(&slot) else {
            return;
        };
        if base.as_ref().is_some_and(|item| patch.reflected_by(item)) {
            self.patches.remove(&slot);
        } else {
            patch.acked = true;
            patch.base = base;
        }
    }

    pub(crate) fn drop_patch(&mut self, id: &str, key: &str) {
        self.patches.remove(&(id.to_string(), key.to_string()));
    }

    pub(crate) fn set_notice(&mut self, message: String) {
        self.notice = Some(message);
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }
}

/// Shared handle to a [`LiveCollection`], with a version counter that ticks
/// on every change so consumers know when to re-render.
pub struct LiveView<T> {
    inner: Arc<Mutex<LiveCollection<T>>>,
    version: Arc<watch::Sender<u64>>,
}

impl<T> Clone for LiveView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            version: self.version.clone(),
        }
    }
}

impl<T: Record> Default for LiveView<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> LiveView<T> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(LiveCollection::default())),
            version: Arc::new(version),
        }
    }

    /// A view fed by a live query. The subscription only holds a weak
    /// reference, so a late snapshot after teardown is ignored.
    pub fn bind(manager: &SubscriptionManager, query: Query) -> (Self, Subscription)
    where
        T: DeserializeOwned,
    {
        let view = Self::new();
        let weak = view.downgrade();
        let subscription = manager.subscribe::<T, _>(query, move |event| {
            let Some(view) = LiveView::upgrade(&weak) else {
                log!(Level::Debug, "Snapshot arrived after its view was torn down");
                return;
            };
            match event {
                Ok(Snapshot { items, generation }) => {
                    view.update(|c| c.apply_snapshot(items, generation))
                }
                Err(err) => view.update(|c| c.fail(err)),
            }
        });
        (view, subscription)
    }

    fn lock(&self) -> MutexGuard<'_, LiveCollection<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn downgrade(&self) -> (Weak<Mutex<LiveCollection<T>>>, Weak<watch::Sender<u64>>) {
        (Arc::downgrade(&self.inner), Arc::downgrade(&self.version))
    }

    fn upgrade(
        weak: &(Weak<Mutex<LiveCollection<T>>>, Weak<watch::Sender<u64>>),
    ) -> Option<Self> {
        Some(Self {
            inner: weak.0.upgrade()?,
            version: weak.1.upgrade()?,
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&LiveCollection<T>) -> R) -> R {
        f(&self.lock())
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut LiveCollection<T>) -> R) -> R {
        let result = f(&mut self.lock());
        self.version.send_modify(|v| *v += 1);
        result
    }

    pub fn items(&self) -> Vec<T> {
        self.read(|c| c.items())
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.read(|c| c.get(id))
    }

    pub fn status(&self) -> ViewStatus {
        self.read(|c| c.status().clone())
    }

    pub fn notice(&self) -> Option<String> {
        self.read(|c| c.notice().map(str::to_string))
    }

    pub fn dismiss_notice(&self) {
        self.update(|c| c.dismiss_notice());
    }

    /// Error callback that leaves the message on the view as a notice.
    pub(crate) fn notifier(&self) -> impl Fn(String) + Send + Sync + 'static {
        let view = self.clone();
        move |message| view.update(|c| c.set_notice(message))
    }

    /// Receiver that changes whenever the view does.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Resolves once `ready` holds for the view.
    pub async fn wait_until(&self, ready: impl Fn(&LiveCollection<T>) -> bool) {
        let mut changes = self.changes();
        loop {
            if self.read(&ready) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}
