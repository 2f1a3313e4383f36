//! Envelope codec.
//!
//! Turns a domain event (plus tags, sender, sequence number, writer id and
//! timestamp) into a stored record and back:
//! - bodies go through a pluggable [`Serializer`] chosen per type or by default
//! - metadata carries the [`JournalKind`], so event and snapshot journals can
//!   share a physical stream
//! - manifests resolve through an explicit [`TypeRegistry`]; unknown
//!   manifests and foreign journal kinds decode to `None`
//!
//! # Example
//!
//! ```ignore
//! let mut types = TypeRegistry::new();
//! types.register_as::<OrderPlaced>("shop.OrderPlaced");
//! let codec = EnvelopeCodec::new(Arc::new(types), &Settings::default());
//!
//! let data = codec.to_event_data(&PersistentRepr::new(
//!     Payload::tagged(Payload::new(order), ["blue"]),
//!     "order-1",
//!     1,
//! ))?;
//! ```

mod adapter;
mod event_adapter;
mod metadata;
mod payload;
mod registry;
mod serializer;

pub use adapter::{AdapterRegistry, EnvelopeCodec, RecordAdapter, DEFAULT_ADAPTER};
pub use event_adapter::{EventAdapter, EventAdapters};
pub use metadata::{EventMetadata, JournalKind};
pub use payload::{
    ActorRegistry, PathResolver, Payload, PersistentRepr, SenderRef, SenderResolver, Tagged,
};
pub use registry::{type_tag, TypeEntry, TypeRegistry};
pub use serializer::{JsonSerializer, MessagePackSerializer, Serializer, SerializerRegistry};
