//! Consumer groups (competing consumers with ack/nack).
//!
//! Each consumer runs on its own thread and pulls the next record of the
//! group under the store lock. Handing a delivery to the consumer happens
//! outside the lock and may block; that is how consumer backpressure
//! reaches the group.

use super::store::{record_at, Inner, State};
use crate::client::{
    Acknowledger, DeliveryHandler, DropHandler, DropReason, NackAction, PersistentDelivery,
    SubscriptionControl,
};
use crate::types::StreamPosition;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// (stream, group)
pub(crate) type GroupKey = (String, String);

const IDLE_WAIT: Duration = Duration::from_millis(50);

pub(crate) struct Consumer {
    pub(crate) on_dropped: DropHandler,
    pub(crate) stopped: Arc<AtomicBool>,
}

/// Server-side state of one consumer group.
#[derive(Default)]
pub(crate) struct GroupState {
    /// Next position never handed out.
    next: u64,
    /// Records to redeliver, with their retry count.
    retry: VecDeque<(StreamPosition, u32)>,
    /// Unacknowledged deliveries: position → (retry count, consumer).
    pub(crate) in_flight: BTreeMap<StreamPosition, (u32, u64)>,
    pub(crate) parked: Vec<StreamPosition>,
    pub(crate) consumers: HashMap<u64, Consumer>,
}

impl GroupState {
    /// Put the given in-flight positions back at the front of the retry queue.
    fn requeue(&mut self, positions: Vec<StreamPosition>) {
        for position in positions.into_iter().rev() {
            if let Some((retry_count, _)) = self.in_flight.remove(&position) {
                self.retry.push_front((position, retry_count + 1));
            }
        }
    }

    /// Remove every consumer, requeue everything in flight, and return the
    /// drop handlers to notify.
    fn drop_consumers(&mut self) -> Vec<DropHandler> {
        let handlers = self
            .consumers
            .drain()
            .map(|(_, consumer)| {
                consumer.stopped.store(true, Ordering::SeqCst);
                consumer.on_dropped
            })
            .collect();
        let positions = self.in_flight.keys().copied().collect();
        self.requeue(positions);
        handlers
    }

    fn remove_consumer(&mut self, consumer: u64) {
        self.consumers.remove(&consumer);
        let owned = self
            .in_flight
            .iter()
            .filter(|(_, (_, owner))| *owner == consumer)
            .map(|(position, _)| *position)
            .collect();
        self.requeue(owned);
    }
}

/// Take the next delivery for `consumer`, or `None` when nothing is
/// available or the consumer's buffer is full.
fn next_delivery(
    state: &mut State,
    inner: &Weak<Inner>,
    key: &GroupKey,
    consumer: u64,
    buffer_size: usize,
) -> Option<PersistentDelivery> {
    let State { streams, groups, .. } = state;
    let group = groups.get_mut(key)?;

    let owned = group
        .in_flight
        .values()
        .filter(|(_, owner)| *owner == consumer)
        .count();
    if owned >= buffer_size {
        return None;
    }

    loop {
        let (position, retry_count) = match group.retry.pop_front() {
            Some(entry) => entry,
            None => {
                let log = streams.get(&key.0)?;
                group.next = group.next.max(log.first_visible());
                if group.next >= log.len() {
                    return None;
                }
                let position = StreamPosition(group.next);
                group.next += 1;
                (position, 0)
            }
        };

        // Deleted or dangling records are skipped.
        let record = match record_at(streams, &key.0, position, true) {
            Some(record) => record,
            None => continue,
        };
        group.in_flight.insert(position, (retry_count, consumer));
        return Some(PersistentDelivery {
            record,
            retry_count,
            acknowledger: Box::new(GroupAck {
                inner: inner.clone(),
                key: key.clone(),
                position,
                retry_count,
            }),
        });
    }
}

pub(crate) fn spawn_consumer(
    inner: &Arc<Inner>,
    key: GroupKey,
    consumer: u64,
    buffer_size: usize,
    on_delivery: DeliveryHandler,
    stopped: Arc<AtomicBool>,
) -> io::Result<()> {
    let weak = Arc::downgrade(inner);
    thread::Builder::new()
        .name(format!("group-{}-{}", key.1, consumer))
        .spawn(move || loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            let delivery = {
                let mut state = inner.state.lock();
                // Checked under the lock so a concurrent stop requeues
                // whatever this consumer took last.
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                match next_delivery(&mut state, &weak, &key, consumer, buffer_size) {
                    Some(delivery) => delivery,
                    None => {
                        inner.changed.wait_for(&mut state, IDLE_WAIT);
                        continue;
                    }
                }
            };
            drop(inner);
            on_delivery(delivery);
        })?;
    Ok(())
}

/// Remove one consumer and requeue its unacknowledged records.
pub(crate) fn stop_consumer(inner: &Inner, key: &GroupKey, consumer: u64) {
    let mut state = inner.state.lock();
    if let Some(group) = state.groups.get_mut(key) {
        group.remove_consumer(consumer);
    }
    inner.changed.notify_all();
}

/// Drop every consumer of a group and notify each one.
pub(crate) fn drop_group(inner: &Inner, key: &GroupKey, reason: DropReason) {
    let handlers = {
        let mut state = inner.state.lock();
        match state.groups.get_mut(key) {
            Some(group) => group.drop_consumers(),
            None => Vec::new(),
        }
    };
    inner.changed.notify_all();
    debug!(stream = %key.0, group = %key.1, count = handlers.len(), ?reason, "dropping consumers");
    for handler in handlers {
        handler(reason.clone());
    }
}

pub(crate) struct ConsumerControl {
    pub(crate) inner: Weak<Inner>,
    pub(crate) key: GroupKey,
    pub(crate) id: u64,
    pub(crate) stopped: Arc<AtomicBool>,
}

impl SubscriptionControl for ConsumerControl {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            stop_consumer(&inner, &self.key, self.id);
            debug!(id = self.id, stream = %self.key.0, group = %self.key.1, "consumer left group");
        }
    }
}

struct GroupAck {
    inner: Weak<Inner>,
    key: GroupKey,
    position: StreamPosition,
    retry_count: u32,
}

impl Acknowledger for GroupAck {
    fn ack(&self) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut state = inner.state.lock();
        if let Some(group) = state.groups.get_mut(&self.key) {
            group.in_flight.remove(&self.position);
            group.retry.retain(|(position, _)| *position != self.position);
        }
        inner.changed.notify_all();
    }

    fn nack(&self, action: NackAction, reason: &str) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let handlers = {
            let mut state = inner.state.lock();
            let group = match state.groups.get_mut(&self.key) {
                Some(group) => group,
                None => return,
            };
            if group.in_flight.remove(&self.position).is_none() {
                return;
            }
            match action {
                NackAction::Retry => {
                    group.retry.push_back((self.position, self.retry_count + 1));
                    Vec::new()
                }
                NackAction::Park => {
                    group.parked.push(self.position);
                    Vec::new()
                }
                NackAction::Skip => Vec::new(),
                NackAction::Stop => {
                    group.retry.push_front((self.position, self.retry_count + 1));
                    group.drop_consumers()
                }
            }
        };
        inner.changed.notify_all();

        warn!(
            stream = %self.key.0,
            group = %self.key.1,
            position = self.position.0,
            ?action,
            reason,
            "record nacked"
        );
        for handler in handlers {
            handler(DropReason::Error(reason.to_string()));
        }
    }
}
