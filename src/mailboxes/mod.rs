//! Mailboxes and their webhook subscriptions.

pub mod model;
pub mod subscriptions;

pub use model::{Mailbox, SlaPolicy, Subscription};
pub use subscriptions::{SubscriptionConfig, SubscriptionManager};
