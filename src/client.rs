//! Contract of the append-only store client.
//!
//! Everything in this crate talks to the store through [`EventStoreClient`].
//! A wire client for the real server implements it outside this crate;
//! [`crate::memory::InMemoryEventStore`] implements it in-process.

use crate::error::Result;
use crate::types::{
    Direction, EventData, ExpectedRevision, ReadFrom, ReadResult, StoredRecord, StreamMetadata,
    StreamPosition, WriteResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A paged read request.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub stream: String,
    pub from: ReadFrom,
    pub direction: Direction,
    pub max_count: usize,
    pub resolve_links: bool,
}

/// A store-native catch-up subscription request.
#[derive(Clone, Debug)]
pub struct CatchUpRequest {
    pub stream: String,
    /// `None` starts at the very beginning; `Some(p)` starts strictly after `p`.
    pub from: Option<StreamPosition>,
    pub resolve_links: bool,
    /// How many records the store may push per batch.
    pub batch_size: usize,
}

/// A consumer-group subscription request.
#[derive(Clone, Debug)]
pub struct PersistentRequest {
    pub stream: String,
    pub group: String,
    /// Maximum number of unacknowledged records the store hands out.
    pub buffer_size: usize,
}

/// Events pushed by a catch-up subscription.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// A replayed or live record.
    Record(StoredRecord),
    /// Finished historical replay, now live.
    CaughtUp,
    /// The store ended the subscription.
    Dropped(DropReason),
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Connection to the server lost.
    ConnectionClosed,
    /// Server shutting down or restarting.
    ServerRestart,
    /// Consumer could not keep up with the store.
    BufferOverflow,
    /// Internal error.
    Error(String),
}

/// Callback receiving catch-up subscription events. Must not block.
pub type SubscriptionListener = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Callback receiving consumer-group deliveries. May block to apply backpressure.
pub type DeliveryHandler = Arc<dyn Fn(PersistentDelivery) + Send + Sync>;

/// Callback invoked once when a consumer-group subscription is dropped.
pub type DropHandler = Arc<dyn Fn(DropReason) + Send + Sync>;

/// Handle to a running store-side subscription.
pub trait SubscriptionControl: Send + Sync {
    /// Stop the subscription. Idempotent.
    fn stop(&self);
}

/// What to do with a negatively acknowledged record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackAction {
    /// Move to the group's parked queue.
    Park,
    /// Redeliver.
    Retry,
    /// Drop without redelivery.
    Skip,
    /// Stop the subscription.
    Stop,
}

/// Ack/nack capability bound to one delivery.
pub trait Acknowledger: Send + Sync {
    fn ack(&self);
    fn nack(&self, action: NackAction, reason: &str);
}

/// One delivery of a consumer-group subscription.
pub struct PersistentDelivery {
    pub record: StoredRecord,
    pub retry_count: u32,
    pub acknowledger: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for PersistentDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentDelivery")
            .field("record", &self.record)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Async client of the append-only store.
///
/// One client may be shared by any number of concurrent queries; the
/// implementation is expected to multiplex.
#[async_trait]
pub trait EventStoreClient: Send + Sync + 'static {
    /// Read one page. A missing stream is reported as
    /// [`ReadResult::StreamNotFound`], not as an error.
    async fn read_stream(&self, request: ReadRequest) -> Result<ReadResult>;

    /// Start a catch-up subscription: replay, then [`SubscriptionEvent::CaughtUp`],
    /// then live records.
    async fn subscribe_to_stream(
        &self,
        request: CatchUpRequest,
        listener: SubscriptionListener,
    ) -> Result<Box<dyn SubscriptionControl>>;

    /// Join a consumer group.
    async fn subscribe_persistent(
        &self,
        request: PersistentRequest,
        on_delivery: DeliveryHandler,
        on_dropped: DropHandler,
    ) -> Result<Box<dyn SubscriptionControl>>;

    /// Append records atomically.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Result<WriteResult>;

    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadata>;

    async fn set_stream_metadata(&self, stream: &str, metadata: StreamMetadata) -> Result<()>;
}
