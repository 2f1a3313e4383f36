//! In-process store implementing [`EventStoreClient`](crate::client::EventStoreClient).
//!
//! Mirrors the semantics the journal relies on: per-stream positions,
//! optimistic concurrency, truncation metadata, link records, catch-up
//! subscriptions and consumer groups. With a [`Projection`] attached it
//! also maintains the tag, all-events and persistence-id link streams the
//! read journal queries.

mod groups;
mod projection;
mod store;

pub use projection::Projection;
pub use store::InMemoryEventStore;
