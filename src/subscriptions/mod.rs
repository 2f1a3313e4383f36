//! Subscriptions on top of the store's native push mechanisms.
//!
//! Two kinds:
//! - catch-up subscriptions replay a stream, report when they are caught
//!   up, then deliver live records; [`SubscriptionManager`] keeps at most
//!   one store subscription per (subscriber, stream) and cleans up when the
//!   subscriber goes away
//! - persistent subscriptions join a server-side consumer group and hand
//!   out records that must be acked or nacked
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(client, 500);
//!
//! let mut records = catch_up(
//!     manager,
//!     CatchUpOptions {
//!         stream: "order-1".into(),
//!         from: None,
//!         resolve_links: false,
//!         mode: CatchUpMode::Live,
//!     },
//!     |record| Ok(Some(record)),
//! );
//! while let Some(record) = records.next().await {
//!     println!("Got record: {:?}", record?);
//! }
//! ```

mod catch_up;
mod manager;
mod persistent;
mod restart;
mod types;

pub use catch_up::{catch_up, CatchUpOptions};
pub use manager::SubscriptionManager;
pub use persistent::{PersistentMessage, PersistentSubscription, PersistentSubscriptionSettings};
pub use restart::{RestartSettings, RestartTracker};
pub use types::{
    CatchUpMode, CatchUpPhase, Subscriber, SubscriberEvent, SubscriberHandle, SubscriberId,
};
