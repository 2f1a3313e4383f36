//! Consumer-facing envelope.

use crate::codec::Payload;
use crate::types::{Offset, Timestamp};
use std::collections::BTreeSet;

/// One event delivered by a read-journal query.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    /// Store position of the record in the queried stream.
    pub offset: Offset,
    pub persistence_id: String,
    pub sequence_nr: u64,
    pub event: Payload,
    pub timestamp: Timestamp,
    pub tags: BTreeSet<String>,
}

impl EventEnvelope {
    /// The event, if it is a `T`.
    pub fn event_as<T: std::any::Any>(&self) -> Option<&T> {
        self.event.downcast_ref::<T>()
    }
}
