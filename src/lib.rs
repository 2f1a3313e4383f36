//! # EventStore Journal
//!
//! An event-sourcing persistence adapter over an append-only event store.
//!
//! ## Core Concepts
//!
//! - **Journal**: Each entity's events go to its own stream, one append per atomic write
//! - **Snapshots**: A snapshot stream per entity, searched newest first
//! - **Read journal**: Lazy queries by entity, tag, all events and persistence ids
//! - **Subscriptions**: Catch-up subscriptions and consumer groups with ack/nack
//!
//! ## Example
//!
//! ```ignore
//! use eventstore_journal::*;
//!
//! let settings = Settings::default();
//! let store = Arc::new(InMemoryEventStore::with_projection(&settings));
//!
//! let mut types = TypeRegistry::new();
//! types.register_as::<OrderPlaced>("shop.OrderPlaced");
//! let codec: Arc<dyn RecordAdapter> = Arc::new(EnvelopeCodec::new(Arc::new(types), &settings));
//!
//! // Write an event
//! let journal = Journal::new(store.clone(), codec.clone(), settings.clone());
//! journal
//!     .write_messages(vec![AtomicWrite::new(
//!         "order-1",
//!         vec![PersistentRepr::new(Payload::tagged(Payload::new(order), ["blue"]), "order-1", 1)],
//!     )])
//!     .await?;
//!
//! // Query it back
//! let read_journal = ReadJournal::new(store, codec, settings);
//! let mut events = read_journal.current_events_by_tag("blue", Offset::NoOffset);
//! while let Some(envelope) = events.next().await {
//!     println!("{:?}", envelope?);
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod journal;
pub mod memory;
pub mod query;
pub mod read_journal;
pub mod snapshot;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use client::{
    Acknowledger, CatchUpRequest, DropReason, EventStoreClient, NackAction, PersistentDelivery,
    PersistentRequest, ReadRequest, SubscriptionControl, SubscriptionEvent,
};
pub use codec::{
    ActorRegistry, AdapterRegistry, EnvelopeCodec, EventAdapter, EventAdapters, EventMetadata,
    JournalKind, Payload, PersistentRepr, RecordAdapter, SenderRef, Serializer, SerializerRegistry,
    Tagged, TypeRegistry,
};
pub use config::Settings;
pub use error::{JournalError, Result};
pub use journal::{AtomicWrite, Journal};
pub use memory::InMemoryEventStore;
pub use query::{EventEnvelope, QueryFilter};
pub use read_journal::{EnvelopeStream, PersistenceIdStream, ReadJournal};
pub use snapshot::{SelectedSnapshot, SnapshotMetadata, SnapshotSelectionCriteria, SnapshotStore};
pub use subscriptions::{
    CatchUpMode, PersistentMessage, PersistentSubscription, PersistentSubscriptionSettings,
    RestartSettings, SubscriptionManager,
};
pub use types::*;
