//! Catch-up subscription as a pull-based stream.
//!
//! The store subscription is issued on first poll. Records are adapted one
//! by one; an adapter returning `Ok(None)` filters the record out.

use crate::client::SubscriptionEvent;
use crate::error::{JournalError, Result};
use crate::types::{StoredRecord, StreamPosition};
use async_stream::try_stream;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use super::manager::SubscriptionManager;
use super::types::{CatchUpMode, CatchUpPhase, SubscriberEvent, SubscriberHandle, SubscriberId};

/// Options of one catch-up query.
#[derive(Clone, Debug)]
pub struct CatchUpOptions {
    pub stream: String,
    /// `None` replays from the beginning; `Some(p)` resumes strictly after `p`.
    pub from: Option<StreamPosition>,
    pub resolve_links: bool,
    pub mode: CatchUpMode,
}

/// Unsubscribes when the consuming stream goes away, whatever the reason.
struct PhaseGuard {
    manager: SubscriptionManager,
    subscriber: SubscriberId,
    stream: String,
    phase: CatchUpPhase,
}

impl PhaseGuard {
    fn enter(&mut self, phase: CatchUpPhase) {
        debug!(stream = %self.stream, from = ?self.phase, to = ?phase, "catch-up phase");
        self.phase = phase;
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if !matches!(self.phase, CatchUpPhase::Completed | CatchUpPhase::Dropped) {
            debug!(stream = %self.stream, phase = ?self.phase, "catch-up cancelled");
            self.phase = CatchUpPhase::Cancelled;
        }
        self.manager.unsubscribe(self.subscriber, &self.stream);
    }
}

/// Open a catch-up subscription stream.
pub fn catch_up<T, F>(
    manager: SubscriptionManager,
    options: CatchUpOptions,
    mut adapt: F,
) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnMut(StoredRecord) -> Result<Option<T>> + Send + 'static,
{
    Box::pin(try_stream! {
        let SubscriberHandle { subscriber, mut receiver } = manager.register();
        let mut guard = PhaseGuard {
            manager: manager.clone(),
            subscriber: subscriber.id(),
            stream: options.stream.clone(),
            phase: CatchUpPhase::AwaitingSubscribe,
        };

        manager
            .subscribe(&subscriber, &options.stream, options.from, options.resolve_links)
            .await?;
        guard.enter(CatchUpPhase::Replaying);

        while let Some(SubscriberEvent { event, .. }) = receiver.recv().await {
            match event {
                SubscriptionEvent::Record(record) => {
                    if let Some(item) = adapt(record)? {
                        yield item;
                    }
                }
                SubscriptionEvent::CaughtUp => {
                    guard.enter(CatchUpPhase::CaughtUp);
                    if options.mode == CatchUpMode::Current {
                        break;
                    }
                }
                SubscriptionEvent::Dropped(reason) => {
                    warn!(stream = %options.stream, ?reason, "catch-up subscription dropped");
                    guard.enter(CatchUpPhase::Dropped);
                    Err::<(), _>(JournalError::SubscriptionDropped {
                        stream: options.stream.clone(),
                        reason,
                    })?;
                }
            }
        }

        guard.enter(CatchUpPhase::Completed);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DropReason;
    use crate::memory::InMemoryEventStore;
    use crate::types::{EventData, ExpectedRevision};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(n: u8) -> EventData {
        EventData {
            event_type: "test".into(),
            data: vec![n],
            metadata: vec![],
        }
    }

    fn options(mode: CatchUpMode, from: Option<StreamPosition>) -> CatchUpOptions {
        CatchUpOptions {
            stream: "s".into(),
            from,
            resolve_links: false,
            mode,
        }
    }

    fn data(record: StoredRecord) -> Result<Option<u8>> {
        Ok(record.data.first().copied())
    }

    fn seeded(n: u8) -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        store
            .append("s", ExpectedRevision::Any, (1..=n).map(event).collect())
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_current_completes_at_head() {
        let store = seeded(3);
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let items: Vec<u8> = catch_up(manager.clone(), options(CatchUpMode::Current, None), data)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_after_position() {
        let store = seeded(5);
        let manager = SubscriptionManager::new(Arc::new(store), 16);

        let items: Vec<u8> = catch_up(
            manager,
            options(CatchUpMode::Current, Some(StreamPosition(2))),
            data,
        )
        .map(|r| r.unwrap())
        .collect()
        .await;
        assert_eq!(items, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_live_delivers_new_records() {
        let store = seeded(2);
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let mut stream = catch_up(manager, options(CatchUpMode::Live, None), data);
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);

        store
            .append("s", ExpectedRevision::Any, vec![event(3)])
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert_eq!(next.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_adapter_filters_records() {
        let store = seeded(4);
        let manager = SubscriptionManager::new(Arc::new(store), 16);

        let evens: Vec<u8> = catch_up(manager, options(CatchUpMode::Current, None), |record| {
            let n = record.data[0];
            Ok((n % 2 == 0).then_some(n))
        })
        .map(|r| r.unwrap())
        .collect()
        .await;
        assert_eq!(evens, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_dropped_fails_stream() {
        let store = seeded(1);
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let mut stream = catch_up(manager.clone(), options(CatchUpMode::Live, None), data);
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        store.drop_catch_up_subscriptions("s", DropReason::ServerRestart);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            JournalError::SubscriptionDropped { reason: DropReason::ServerRestart, .. }
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unsubscribes() {
        let store = seeded(1);
        let manager = SubscriptionManager::new(Arc::new(store.clone()), 16);

        let mut stream = catch_up(manager.clone(), options(CatchUpMode::Live, None), data);
        stream.next().await.unwrap().unwrap();
        assert_eq!(store.catch_up_subscription_count(), 1);

        drop(stream);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.catch_up_subscription_count(), 0);
    }
}
