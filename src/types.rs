//! Core types shared by the journal, the snapshot store and the read side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 0-based, store-assigned position of a record within one physical stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StreamPosition(pub u64);

impl fmt::Debug for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamPosition {
    /// Following position; saturates at the last representable one.
    pub fn next(self) -> Self {
        StreamPosition(self.0.saturating_add(1))
    }

    /// Preceding position; `None` at the start of a stream.
    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(StreamPosition(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Scan direction of a stream read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Forwards,
    Backwards,
}

/// Where a read starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadFrom {
    /// First record of the stream.
    Start,
    /// Last record of the stream (meaningful for backwards reads).
    End,
    /// A concrete position, inclusive.
    Position(StreamPosition),
}

/// Opaque query offset handed to and returned from the read journal.
///
/// Offsets are exclusive: resuming from `Sequence(n)` yields records after `n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Offset {
    #[default]
    NoOffset,
    Sequence(u64),
}

/// Position of the link record a resolved record was reached through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub stream: String,
    pub position: StreamPosition,
}

/// A single record as returned by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    /// Stream the record was originally written to.
    pub stream: String,

    /// Position in that stream.
    pub position: StreamPosition,

    /// Short type tag (e.g. "orderPlaced").
    pub event_type: String,

    /// Serialized body.
    pub data: Vec<u8>,

    /// Serialized metadata.
    pub metadata: Vec<u8>,

    /// When the store accepted the record.
    pub created: Timestamp,

    /// Set when the record was read through a link in a projection stream.
    pub link: Option<LinkInfo>,
}

impl StoredRecord {
    /// Position a reader of this stream resumes after.
    pub fn resume_position(&self) -> StreamPosition {
        match &self.link {
            Some(link) => link.position,
            None => self.position,
        }
    }
}

/// A record to append (before the store assigns a position).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Optimistic concurrency expectation for an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedRevision {
    Any,
    NoStream,
    StreamExists,
    /// The position of the current last record.
    Exact(StreamPosition),
}

/// Result of a successful append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// Position of the last record written.
    pub next_expected: StreamPosition,
}

/// Store-side stream metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Records before this position are logically deleted.
    #[serde(default, rename = "$tb", skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<StreamPosition>,

    /// Maximum number of records the store keeps.
    #[serde(default, rename = "$maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
}

/// Outcome of a paged read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadResult {
    Ok(Vec<StoredRecord>),
    StreamNotFound,
}
