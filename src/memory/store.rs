//! Stream logs, reads, appends and catch-up subscriptions.

use super::groups::{self, Consumer, GroupKey, GroupState};
use super::projection::Projection;
use crate::client::{
    CatchUpRequest, DeliveryHandler, DropHandler, DropReason, EventStoreClient, PersistentRequest,
    ReadRequest, SubscriptionControl, SubscriptionEvent, SubscriptionListener,
};
use crate::config::Settings;
use crate::error::{JournalError, Result};
use crate::types::{
    Direction, EventData, ExpectedRevision, LinkInfo, ReadFrom, ReadResult, StoredRecord,
    StreamMetadata, StreamPosition, Timestamp, WriteResult,
};
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Event type of an unresolved link record.
const LINK_EVENT_TYPE: &str = "$>";

/// One slot of a stream log.
#[derive(Clone, Debug)]
enum Entry {
    Record(StoredRecord),
    /// Pointer to a record in another stream.
    Link {
        target_stream: String,
        target_position: StreamPosition,
        created: Timestamp,
    },
}

/// Append-only log of one stream.
#[derive(Default)]
pub(crate) struct StreamLog {
    entries: Vec<Entry>,
    metadata: StreamMetadata,
}

impl StreamLog {
    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_position(&self) -> Option<StreamPosition> {
        self.len().checked_sub(1).map(StreamPosition)
    }

    /// First position not hidden by truncation or max-count.
    pub(crate) fn first_visible(&self) -> u64 {
        let truncated = self.metadata.truncate_before.map_or(0, |p| p.0);
        let capped = self
            .metadata
            .max_count
            .map_or(0, |max| self.len().saturating_sub(max));
        truncated.max(capped)
    }

    fn is_visible(&self, position: StreamPosition) -> bool {
        position.0 >= self.first_visible() && position.0 < self.len()
    }
}

/// Resolve the entry at `position` of `stream` into a record.
///
/// With `resolve_links`, a link yields the target record (carrying
/// [`LinkInfo`]) or nothing when the target is gone.
pub(crate) fn record_at(
    streams: &HashMap<String, StreamLog>,
    stream: &str,
    position: StreamPosition,
    resolve_links: bool,
) -> Option<StoredRecord> {
    let log = streams.get(stream)?;
    if !log.is_visible(position) {
        return None;
    }
    match log.entries.get(position.0 as usize)? {
        Entry::Record(record) => Some(record.clone()),
        Entry::Link {
            target_stream,
            target_position,
            created,
        } => {
            if !resolve_links {
                return Some(StoredRecord {
                    stream: stream.to_string(),
                    position,
                    event_type: LINK_EVENT_TYPE.to_string(),
                    data: format!("{}@{}", target_position.0, target_stream).into_bytes(),
                    metadata: Vec::new(),
                    created: *created,
                    link: None,
                });
            }
            let target = streams.get(target_stream)?;
            if !target.is_visible(*target_position) {
                return None;
            }
            match target.entries.get(target_position.0 as usize)? {
                Entry::Record(record) => {
                    let mut record = record.clone();
                    record.link = Some(LinkInfo {
                        stream: stream.to_string(),
                        position,
                    });
                    Some(record)
                }
                Entry::Link { .. } => None,
            }
        }
    }
}

struct LiveSubscription {
    stream: String,
    resolve_links: bool,
    listener: SubscriptionListener,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) streams: HashMap<String, StreamLog>,
    catch_up: HashMap<u64, LiveSubscription>,
    pub(crate) groups: HashMap<GroupKey, GroupState>,
}

impl State {
    fn check_expected(&self, stream: &str, expected: ExpectedRevision) -> Result<()> {
        let last = self.streams.get(stream).and_then(StreamLog::last_position);
        let ok = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => last.is_none(),
            ExpectedRevision::StreamExists => last.is_some(),
            ExpectedRevision::Exact(position) => last == Some(position),
        };
        if ok {
            return Ok(());
        }
        Err(JournalError::WrongExpectedVersion {
            stream: stream.to_string(),
            expected: format!("{:?}", expected),
            actual: match last {
                Some(position) => position.to_string(),
                None => "no stream".to_string(),
            },
        })
    }

    fn push(
        &mut self,
        stream: &str,
        entry: impl FnOnce(StreamPosition) -> Entry,
    ) -> StreamPosition {
        let log = self.streams.entry(stream.to_string()).or_default();
        let position = StreamPosition(log.len());
        log.entries.push(entry(position));
        position
    }

    fn read(&self, request: &ReadRequest) -> ReadResult {
        let log = match self.streams.get(&request.stream) {
            Some(log) if log.len() > 0 => log,
            _ => return ReadResult::StreamNotFound,
        };
        let len = log.len();
        let first = log.first_visible();

        let positions: Box<dyn Iterator<Item = u64>> = match request.direction {
            Direction::Forwards => {
                let start = match request.from {
                    ReadFrom::Start => 0,
                    ReadFrom::End => len,
                    ReadFrom::Position(p) => p.0,
                };
                Box::new(start.max(first)..len)
            }
            Direction::Backwards => {
                let start = match request.from {
                    ReadFrom::Start => 0,
                    ReadFrom::End => len - 1,
                    ReadFrom::Position(p) => p.0.min(len - 1),
                };
                if start < first {
                    Box::new(std::iter::empty())
                } else {
                    Box::new((first..=start).rev())
                }
            }
        };

        let records = positions
            .filter_map(|p| {
                record_at(&self.streams, &request.stream, StreamPosition(p), request.resolve_links)
            })
            .take(request.max_count)
            .collect();
        ReadResult::Ok(records)
    }

    /// Push newly written entries to catch-up subscribers of their streams.
    fn publish(&self, written: &[(String, StreamPosition)]) {
        for (stream, position) in written {
            for subscription in self.catch_up.values().filter(|s| &s.stream == stream) {
                if let Some(record) =
                    record_at(&self.streams, stream, *position, subscription.resolve_links)
                {
                    (subscription.listener)(SubscriptionEvent::Record(record));
                }
            }
        }
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    /// Signalled on every append, ack and nack.
    pub(crate) changed: Condvar,
    next_id: AtomicU64,
    projection: Option<Projection>,
    read_faults: AtomicUsize,
}

impl Inner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// In-process append-only store.
///
/// Cheap to clone; clones share the same streams.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Store without projections.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Store maintaining the link streams described by `settings`.
    pub fn with_projection(settings: &Settings) -> Self {
        Self::build(Some(Projection::new(settings)))
    }

    fn build(projection: Option<Projection>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
                next_id: AtomicU64::new(1),
                projection,
                read_faults: AtomicUsize::new(0),
            }),
        }
    }

    /// Append `events` atomically, then run projections and notify
    /// subscribers.
    pub fn append(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        let mut state = self.inner.state.lock();
        state.check_expected(stream, expected)?;

        if events.is_empty() {
            let last = state.streams.get(stream).and_then(StreamLog::last_position);
            return Ok(WriteResult {
                next_expected: last.unwrap_or_default(),
            });
        }

        let created = Timestamp::now();
        let mut written = Vec::with_capacity(events.len());
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            let position = state.push(stream, |position| {
                Entry::Record(StoredRecord {
                    stream: stream.to_string(),
                    position,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                    created,
                    link: None,
                })
            });
            written.push((stream.to_string(), position));
            appended.push(position);
        }

        if let Some(projection) = &self.inner.projection {
            for position in &appended {
                let targets = match record_at(&state.streams, stream, *position, false) {
                    Some(record) => projection.link_targets(stream, &record),
                    None => continue,
                };
                for target in targets {
                    let link_position = state.push(&target, |_| Entry::Link {
                        target_stream: stream.to_string(),
                        target_position: *position,
                        created,
                    });
                    written.push((target, link_position));
                }
            }
        }

        state.publish(&written);
        self.inner.changed.notify_all();

        let last = appended.last().copied().unwrap_or_default();
        trace!(stream, count = appended.len(), last = last.0, "appended");
        Ok(WriteResult {
            next_expected: last,
        })
    }

    /// Read one page.
    pub fn read(&self, request: &ReadRequest) -> Result<ReadResult> {
        let faulted = self
            .inner
            .read_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(JournalError::Store(format!(
                "injected read fault on {}",
                request.stream
            )));
        }
        Ok(self.inner.state.lock().read(request))
    }

    /// Metadata of `stream`; the default when never set.
    pub fn stream_metadata(&self, stream: &str) -> StreamMetadata {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|log| log.metadata.clone())
            .unwrap_or_default()
    }

    /// Replace the metadata of `stream`, creating it if needed.
    pub fn set_metadata(&self, stream: &str, metadata: StreamMetadata) {
        let mut state = self.inner.state.lock();
        debug!(stream, ?metadata, "stream metadata updated");
        state.streams.entry(stream.to_string()).or_default().metadata = metadata;
        self.inner.changed.notify_all();
    }

    /// Position of the last record of `stream`, hidden or not.
    pub fn last_position(&self, stream: &str) -> Option<StreamPosition> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .and_then(StreamLog::last_position)
    }

    /// Make the next `count` reads fail with a store error.
    pub fn inject_read_faults(&self, count: usize) {
        self.inner.read_faults.store(count, Ordering::SeqCst);
    }

    /// Replay, mark caught up, then go live.
    pub fn subscribe_catch_up(
        &self,
        request: CatchUpRequest,
        listener: SubscriptionListener,
    ) -> Box<dyn SubscriptionControl> {
        let id = self.inner.next_id();
        let mut state = self.inner.state.lock();

        let start = request.from.map_or(0, |p| p.next().0);
        let (first, len) = state
            .streams
            .get(&request.stream)
            .map_or((0, 0), |log| (log.first_visible(), log.len()));
        for position in start.max(first)..len {
            if let Some(record) = record_at(
                &state.streams,
                &request.stream,
                StreamPosition(position),
                request.resolve_links,
            ) {
                listener(SubscriptionEvent::Record(record));
            }
        }
        listener(SubscriptionEvent::CaughtUp);

        debug!(id, stream = %request.stream, from = ?request.from, "catch-up subscription started");
        state.catch_up.insert(
            id,
            LiveSubscription {
                stream: request.stream,
                resolve_links: request.resolve_links,
                listener,
            },
        );
        Box::new(CatchUpControl {
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// End every catch-up subscription on `stream` as if the server dropped it.
    pub fn drop_catch_up_subscriptions(&self, stream: &str, reason: DropReason) {
        let listeners: Vec<SubscriptionListener> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state
                .catch_up
                .iter()
                .filter(|(_, s)| s.stream == stream)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.catch_up.remove(&id))
                .map(|s| s.listener)
                .collect()
        };
        debug!(stream, count = listeners.len(), ?reason, "dropping catch-up subscriptions");
        for listener in listeners {
            listener(SubscriptionEvent::Dropped(reason.clone()));
        }
    }

    /// Number of live catch-up subscriptions.
    pub fn catch_up_subscription_count(&self) -> usize {
        self.inner.state.lock().catch_up.len()
    }

    /// Join the consumer group `request.group` on `request.stream`.
    pub fn subscribe_group(
        &self,
        request: PersistentRequest,
        on_delivery: DeliveryHandler,
        on_dropped: DropHandler,
    ) -> Result<Box<dyn SubscriptionControl>> {
        let id = self.inner.next_id();
        let key: GroupKey = (request.stream.clone(), request.group.clone());
        let stopped = Arc::new(AtomicBool::new(false));

        self.inner
            .state
            .lock()
            .groups
            .entry(key.clone())
            .or_default()
            .consumers
            .insert(
                id,
                Consumer {
                    on_dropped,
                    stopped: Arc::clone(&stopped),
                },
            );

        if let Err(e) = groups::spawn_consumer(
            &self.inner,
            key.clone(),
            id,
            request.buffer_size.max(1),
            on_delivery,
            Arc::clone(&stopped),
        ) {
            groups::stop_consumer(&self.inner, &key, id);
            return Err(JournalError::Store(format!("failed to start consumer: {}", e)));
        }

        debug!(id, stream = %key.0, group = %key.1, "consumer joined group");
        Ok(Box::new(groups::ConsumerControl {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
            stopped,
        }))
    }

    /// End every consumer of a group as if the server dropped them.
    /// Unacknowledged records are redelivered on resubscribe.
    pub fn drop_persistent_subscriptions(&self, stream: &str, group: &str, reason: DropReason) {
        groups::drop_group(&self.inner, &(stream.to_string(), group.to_string()), reason);
    }

    /// Consumers currently joined to `group` on `stream`.
    pub fn persistent_consumer_count(&self, stream: &str, group: &str) -> usize {
        self.with_group(stream, group, |g| g.consumers.len())
    }

    /// Deliveries of `group` awaiting ack or nack.
    pub fn in_flight_count(&self, stream: &str, group: &str) -> usize {
        self.with_group(stream, group, |g| g.in_flight.len())
    }

    /// Positions `group` has parked.
    pub fn parked(&self, stream: &str, group: &str) -> Vec<StreamPosition> {
        self.with_group(stream, group, |g| g.parked.clone())
    }

    fn with_group<T: Default>(
        &self,
        stream: &str,
        group: &str,
        f: impl FnOnce(&GroupState) -> T,
    ) -> T {
        self.inner
            .state
            .lock()
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(f)
            .unwrap_or_default()
    }
}

struct CatchUpControl {
    id: u64,
    inner: Weak<Inner>,
}

impl SubscriptionControl for CatchUpControl {
    fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.state.lock().catch_up.remove(&self.id).is_some() {
                debug!(id = self.id, "catch-up subscription stopped");
            }
        }
    }
}

#[async_trait]
impl EventStoreClient for InMemoryEventStore {
    async fn read_stream(&self, request: ReadRequest) -> Result<ReadResult> {
        self.read(&request)
    }

    async fn subscribe_to_stream(
        &self,
        request: CatchUpRequest,
        listener: SubscriptionListener,
    ) -> Result<Box<dyn SubscriptionControl>> {
        Ok(self.subscribe_catch_up(request, listener))
    }

    async fn subscribe_persistent(
        &self,
        request: PersistentRequest,
        on_delivery: DeliveryHandler,
        on_dropped: DropHandler,
    ) -> Result<Box<dyn SubscriptionControl>> {
        self.subscribe_group(request, on_delivery, on_dropped)
    }

    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        self.append(stream, expected, events)
    }

    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadata> {
        Ok(self.stream_metadata(stream))
    }

    async fn set_stream_metadata(&self, stream: &str, metadata: StreamMetadata) -> Result<()> {
        self.set_metadata(stream, metadata);
        Ok(())
    }
}
