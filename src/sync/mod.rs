pub mod mutation;
pub mod subscription;
pub mod view;

pub use mutation::{Field, MutationCoordinator, Outcome, Tentative, Toggle};
pub use subscription::{Snapshot, Subscription, SubscriptionManager};
pub use view::{LiveCollection, LiveView, ViewStatus};
