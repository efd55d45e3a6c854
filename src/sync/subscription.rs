//! Live query subscriptions.
//!
//! A subscription owns one channel against the store and hands each complete
//! snapshot to its callback in arrival order. Cancelling (or dropping the
//! handle) guarantees the callback is never invoked again, even when the
//! cancel happens from inside the callback itself.

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::{log, Level};
use serde::de::DeserializeOwned;
use tokio::task::AbortHandle;

use crate::{
    error::{CampusError, CampusResult},
    schema::query::Query,
    store::{Document, DocumentStore},
};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// One full result set. `generation` counts deliveries on the subscription,
/// starting at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub items: Vec<T>,
    pub generation: u64,
}

type Callback<T> = Box<dyn FnMut(CampusResult<Snapshot<T>>) + Send>;

struct Slot<T> {
    id: u64,
    cancelled: AtomicBool,
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> Slot<T> {
    /// Returns whether the subscription is still live afterwards.
    fn deliver(&self, event: CampusResult<Snapshot<T>>) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        let mut callback = match self.callback.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(f) = callback.as_mut() {
            DELIVERING.with(|d| d.set(Some(self.id)));
            f(event);
            DELIVERING.with(|d| d.set(None));
        }
        if self.cancelled.load(Ordering::SeqCst) {
            *callback = None;
            return false;
        }
        true
    }

    fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut callback) = self.callback.lock() {
            *callback = None;
        }
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

impl<T: Send> Cancel for Slot<T> {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Inside our own callback: deliver() drops it once the call returns.
        if DELIVERING.with(|d| d.get()) == Some(self.id) {
            return;
        }
        // Waits out a delivery running on another thread.
        if let Ok(mut callback) = self.callback.lock() {
            *callback = None;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancellation handle for a live query. Dropping it cancels.
pub struct Subscription {
    slot: Arc<dyn Cancel>,
    task: AbortHandle,
}

impl Subscription {
    /// Stops deliveries and releases the channel. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.slot.is_cancelled() {
            log!(Level::Debug, "Cancelling subscription");
        }
        self.slot.cancel();
        self.task.abort();
    }

    /// False once cancelled or once the channel has failed.
    pub fn is_active(&self) -> bool {
        !self.slot.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Opens live queries against a [`DocumentStore`].
#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Delivers every snapshot of `query`, decoded as `T`, to `on_snapshot`.
    ///
    /// The callback runs at least once after the channel is up (possibly with
    /// an empty result). If the channel cannot be established or is later
    /// lost, it receives a single [`CampusError::ChannelError`] (or
    /// [`CampusError::PermissionDenied`]) and is never called again; no retry
    /// is attempted. Must be called within a tokio runtime.
    pub fn subscribe<T, F>(&self, query: Query, on_snapshot: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(CampusResult<Snapshot<T>>) + Send + 'static,
    {
        let slot = Arc::new(Slot {
            id: NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(on_snapshot) as Callback<T>)),
        });
        let store = self.store.clone();
        let task_slot = slot.clone();
        let collection = query.target.collection().to_string();

        let task = tokio::spawn(async move {
            let mut feed = match store.listen(&query).await {
                Ok(feed) => feed,
                Err(e) => {
                    log!(Level::Error, "Could not subscribe to {collection}: {e}");
                    task_slot.deliver(Err(CampusError::from_read(e)));
                    task_slot.close();
                    return;
                }
            };
            log!(Level::Debug, "Subscribed to {collection}");

            let mut generation = 0;
            while let Some(received) = feed.next().await {
                let docs = match received {
                    Ok(docs) => docs,
                    Err(e) => {
                        log!(Level::Error, "Subscription to {collection} dropped: {e}");
                        task_slot.deliver(Err(CampusError::from_read(e)));
                        task_slot.close();
                        return;
                    }
                };
                generation += 1;
                let items = decode_all::<T>(&docs, &collection);
                log!(
                    Level::Trace,
                    "Snapshot {generation} of {collection}: {} items",
                    items.len()
                );
                if !task_slot.deliver(Ok(Snapshot { items, generation })) {
                    return;
                }
            }

            task_slot.deliver(Err(CampusError::ChannelError(format!(
                "{collection} channel closed"
            ))));
            task_slot.close();
        });

        Subscription {
            slot: slot as Arc<dyn Cancel>,
            task: task.abort_handle(),
        }
    }
}

/// Malformed documents are skipped rather than failing the whole snapshot.
fn decode_all<T: DeserializeOwned>(docs: &[Document], collection: &str) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<T>() {
            Ok(item) => Some(item),
            Err(e) => {
                log!(Level::Warn, "Skipping document in {collection}: {e}");
                None
            }
        })
        .collect()
}
