//! Catch-up subscription manager.
//!
//! Owns the map of subscriber → store-native subscriptions. Every access
//! goes through one mutex, so subscribe, unsubscribe and liveness-driven
//! cleanup are serialized.

use crate::client::{
    CatchUpRequest, EventStoreClient, SubscriptionControl, SubscriptionEvent, SubscriptionListener,
};
use crate::error::Result;
use crate::types::StreamPosition;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::types::{Subscriber, SubscriberEvent, SubscriberHandle, SubscriberId};

/// Store subscriptions of one subscriber.
#[derive(Default)]
struct SubscriberState {
    streams: HashMap<String, Box<dyn SubscriptionControl>>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, SubscriberState>,
    /// Subscribers with a running liveness watcher. Outlives their entry in
    /// `subscribers`, so a re-subscribe does not start a second watcher.
    watched: HashSet<SubscriberId>,
}

struct Inner {
    client: Arc<dyn EventStoreClient>,
    subscriptions: Mutex<Registry>,
    next_id: AtomicU64,
    batch_size: usize,
}

/// Manages store-native catch-up subscriptions per subscriber.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager; `batch_size` is handed to the store as the push batch size.
    pub fn new(client: Arc<dyn EventStoreClient>, batch_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                subscriptions: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                batch_size: batch_size.max(1),
            }),
        }
    }

    /// Create a new subscriber with an unbounded, demand-drained buffer.
    pub fn register(&self) -> SubscriberHandle {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        SubscriberHandle {
            subscriber: Subscriber { id, sender },
            receiver,
        }
    }

    /// Subscribe `subscriber` to `stream`.
    ///
    /// A second subscribe for the same (subscriber, stream) is a no-op. If the
    /// subscriber goes away while the store subscription is being set up, the
    /// fresh store subscription is stopped instead of registered.
    pub async fn subscribe(
        &self,
        subscriber: &Subscriber,
        stream: &str,
        from: Option<StreamPosition>,
        resolve_links: bool,
    ) -> Result<()> {
        if self.is_subscribed(subscriber.id, stream) || !subscriber.is_alive() {
            return Ok(());
        }

        let sender = subscriber.sender.clone();
        let stream_name = stream.to_string();
        let listener: SubscriptionListener = Arc::new(move |event: SubscriptionEvent| {
            let _ = sender.send(SubscriberEvent {
                stream: stream_name.clone(),
                event,
            });
        });

        let control = self
            .inner
            .client
            .subscribe_to_stream(
                CatchUpRequest {
                    stream: stream.to_string(),
                    from,
                    resolve_links,
                    batch_size: self.inner.batch_size,
                },
                listener,
            )
            .await?;

        let rejected = {
            let mut subs = self.inner.subscriptions.lock();
            if !subscriber.is_alive() {
                Some(control)
            } else {
                let state = subs.subscribers.entry(subscriber.id).or_default();
                if state.streams.contains_key(stream) {
                    Some(control)
                } else {
                    state.streams.insert(stream.to_string(), control);
                    if subs.watched.insert(subscriber.id) {
                        self.watch(subscriber);
                    }
                    None
                }
            }
        };

        match rejected {
            Some(control) => {
                debug!(subscriber = subscriber.id.0, stream, "discarding store subscription");
                control.stop();
            }
            None => {
                debug!(subscriber = subscriber.id.0, stream, ?from, "subscribed");
            }
        }
        Ok(())
    }

    /// Stop the store subscription of `subscriber` on `stream`.
    pub fn unsubscribe(&self, id: SubscriberId, stream: &str) {
        let control = {
            let mut subs = self.inner.subscriptions.lock();
            let control = subs
                .subscribers
                .get_mut(&id)
                .and_then(|s| s.streams.remove(stream));
            if subs.subscribers.get(&id).map_or(false, |s| s.streams.is_empty()) {
                subs.subscribers.remove(&id);
            }
            control
        };
        if let Some(control) = control {
            debug!(subscriber = id.0, stream, "unsubscribed");
            control.stop();
        }
    }

    /// Stop every store subscription of `subscriber`.
    pub fn unsubscribe_all(&self, id: SubscriberId) {
        let state = self.inner.subscriptions.lock().subscribers.remove(&id);
        if let Some(state) = state {
            for (stream, control) in state.streams {
                debug!(subscriber = id.0, stream = %stream, "unsubscribed");
                control.stop();
            }
        }
    }

    /// Whether `id` holds a store subscription on `stream`.
    pub fn is_subscribed(&self, id: SubscriberId, stream: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .subscribers
            .get(&id)
            .map_or(false, |s| s.streams.contains_key(stream))
    }

    /// Number of live store subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .subscribers
            .values()
            .map(|s| s.streams.len())
            .sum()
    }

    /// Number of subscribers with a running liveness watcher.
    pub fn watcher_count(&self) -> usize {
        self.inner.subscriptions.lock().watched.len()
    }

    /// Clean up after `subscriber` once its receiving end is gone. Called
    /// with the subscription map locked.
    fn watch(&self, subscriber: &Subscriber) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let sender = subscriber.sender.clone();
        let id = subscriber.id;
        tokio::spawn(async move {
            sender.closed().await;
            if let Some(inner) = weak.upgrade() {
                debug!(subscriber = id.0, "subscriber terminated, cleaning up");
                inner.subscriptions.lock().watched.remove(&id);
                SubscriptionManager { inner }.unsubscribe_all(id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventStore;
    use crate::types::{EventData, ExpectedRevision};
    use std::time::Duration;

    fn event(n: u8) -> EventData {
        EventData {
            event_type: "test".into(),
            data: vec![n],
            metadata: vec![],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let store = InMemoryEventStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let handle = manager.register();
        manager
            .subscribe(&handle.subscriber, "s", None, false)
            .await
            .unwrap();
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(store.catch_up_subscription_count(), 1);

        manager.unsubscribe(handle.subscriber.id(), "s");
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_one_store_subscription_per_stream() {
        let store = InMemoryEventStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let handle = manager.register();
        for _ in 0..3 {
            manager
                .subscribe(&handle.subscriber, "s", None, false)
                .await
                .unwrap();
        }
        manager
            .subscribe(&handle.subscriber, "t", None, false)
            .await
            .unwrap();

        assert_eq!(manager.subscription_count(), 2);
        assert_eq!(store.catch_up_subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_replay_then_caught_up_then_live() {
        let store = InMemoryEventStore::new();
        store
            .append("s", ExpectedRevision::Any, vec![event(1), event(2)])
            .unwrap();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let mut handle = manager.register();
        manager
            .subscribe(&handle.subscriber, "s", None, false)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(handle.recv().await.unwrap().event);
        }
        assert!(matches!(seen[0], SubscriptionEvent::Record(ref r) if r.data == vec![1]));
        assert!(matches!(seen[1], SubscriptionEvent::Record(ref r) if r.data == vec![2]));
        assert!(matches!(seen[2], SubscriptionEvent::CaughtUp));

        store
            .append("s", ExpectedRevision::Any, vec![event(3)])
            .unwrap();
        let live = handle.recv().await.unwrap();
        assert_eq!(live.stream, "s");
        assert!(matches!(live.event, SubscriptionEvent::Record(ref r) if r.data == vec![3]));
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_one_watcher() {
        let store = InMemoryEventStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let handle = manager.register();
        for _ in 0..3 {
            manager
                .subscribe(&handle.subscriber, "s", None, false)
                .await
                .unwrap();
            manager.unsubscribe(handle.subscriber.id(), "s");
        }
        manager
            .subscribe(&handle.subscriber, "s", None, false)
            .await
            .unwrap();
        assert_eq!(manager.watcher_count(), 1);

        drop(handle);
        settle().await;
        assert_eq!(manager.watcher_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_cleaned_up() {
        let store = InMemoryEventStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let handle = manager.register();
        manager
            .subscribe(&handle.subscriber, "s", None, false)
            .await
            .unwrap();
        assert_eq!(store.catch_up_subscription_count(), 1);

        drop(handle);
        settle().await;

        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_dead_before_registration() {
        let store = InMemoryEventStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let handle = manager.register();
        let subscriber = handle.subscriber.clone();
        drop(handle);

        manager.subscribe(&subscriber, "s", None, false).await.unwrap();
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }
}
