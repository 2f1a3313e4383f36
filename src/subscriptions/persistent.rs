//! Consumer-group subscription as a pull-based stream with ack/nack.
//!
//! Deliveries pushed by the store land in a bounded buffer; when it is full
//! the store's delivery callback blocks, which is the backpressure signal.
//! A drop reported by the store surfaces after every buffered delivery has
//! been handed out. With a [`RestartSettings`] the subscription is reopened
//! after a backoff; without one the consumer receives the drop as an error.

use crate::client::{
    Acknowledger, DeliveryHandler, DropHandler, DropReason, EventStoreClient, NackAction,
    PersistentDelivery, PersistentRequest, SubscriptionControl,
};
use crate::error::{JournalError, Result};
use crate::types::StoredRecord;
use async_stream::try_stream;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::restart::RestartSettings;

/// Parameters of a consumer-group subscription.
#[derive(Clone, Debug)]
pub struct PersistentSubscriptionSettings {
    pub stream: String,
    pub group: String,
    /// Deliveries buffered ahead of consumer demand.
    pub max_buffer_size: usize,
    pub restart: Option<RestartSettings>,
}

impl PersistentSubscriptionSettings {
    /// Join `group` on `stream` with a 500-record buffer and no restarts.
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            max_buffer_size: 500,
            restart: None,
        }
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size.max(1);
        self
    }

    pub fn restart(mut self, restart: RestartSettings) -> Self {
        self.restart = Some(restart);
        self
    }
}

/// One record handed out by a consumer group.
pub struct PersistentMessage {
    pub record: StoredRecord,
    /// How often the record was delivered before.
    pub retry_count: u32,
    acknowledger: Box<dyn Acknowledger>,
}

impl PersistentMessage {
    /// Mark the record as processed.
    pub fn ack(self) {
        self.acknowledger.ack();
    }

    /// Reject the record; `action` decides what the group does with it.
    pub fn nack(self, action: NackAction, reason: &str) {
        self.acknowledger.nack(action, reason);
    }
}

impl From<PersistentDelivery> for PersistentMessage {
    fn from(delivery: PersistentDelivery) -> Self {
        Self {
            record: delivery.record,
            retry_count: delivery.retry_count,
            acknowledger: delivery.acknowledger,
        }
    }
}

impl std::fmt::Debug for PersistentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMessage")
            .field("record", &self.record)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Cancellation shared between the stream, its enumerators, the blocking
/// dequeue and the store's delivery callback.
struct CancelSignal {
    cancelled: AtomicBool,
    /// Dropped on cancel; the receiver side then reports disconnection.
    trigger: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    notify: Notify,
    /// Store subscription of the current enumerator.
    control: Mutex<Option<Box<dyn SubscriptionControl>>>,
}

impl CancelSignal {
    fn new() -> Self {
        let (trigger, receiver) = bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            receiver,
            notify: Notify::new(),
            control: Mutex::new(None),
        }
    }

    /// Stop the store subscription and wake every waiter.
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.trigger.lock().take();
            self.detach();
            self.notify.notify_waiters();
        }
    }

    /// Hand over the store subscription of a freshly opened enumerator. It is
    /// stopped right away when cancellation already happened.
    fn attach(&self, control: Box<dyn SubscriptionControl>) {
        let mut slot = self.control.lock();
        if self.is_cancelled() {
            drop(slot);
            control.stop();
            return;
        }
        if let Some(previous) = slot.replace(control) {
            previous.stop();
        }
    }

    /// Stop the attached store subscription, if any.
    fn detach(&self) {
        let control = self.control.lock().take();
        if let Some(control) = control {
            control.stop();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

enum Next {
    Item(PersistentMessage),
    Dropped(DropReason),
    Cancelled,
}

/// Wait for the next delivery, the drop notice or cancellation. Buffered
/// deliveries win over a pending drop.
fn wait_next(
    items: &Receiver<PersistentMessage>,
    dropped: &Receiver<DropReason>,
    pending_drop: &Mutex<Option<DropReason>>,
    cancel: &CancelSignal,
) -> Next {
    if cancel.is_cancelled() {
        return Next::Cancelled;
    }
    if let Ok(item) = items.try_recv() {
        return Next::Item(item);
    }
    if let Some(reason) = pending_drop.lock().take() {
        return Next::Dropped(reason);
    }

    select! {
        recv(items) -> item => match item {
            Ok(item) => Next::Item(item),
            Err(_) => Next::Dropped(dropped.try_recv().unwrap_or(DropReason::ConnectionClosed)),
        },
        recv(dropped) -> reason => {
            let reason = reason.unwrap_or(DropReason::ConnectionClosed);
            match items.try_recv() {
                Ok(item) => {
                    *pending_drop.lock() = Some(reason);
                    Next::Item(item)
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Next::Dropped(reason),
            }
        },
        recv(cancel.receiver) -> _ => Next::Cancelled,
    }
}

/// One store subscription of a consumer group.
struct Enumerator {
    settings: PersistentSubscriptionSettings,
    items: Receiver<PersistentMessage>,
    dropped: Receiver<DropReason>,
    pending_drop: Arc<Mutex<Option<DropReason>>>,
    cancel: Arc<CancelSignal>,
}

impl Enumerator {
    async fn open(
        client: &Arc<dyn EventStoreClient>,
        settings: &PersistentSubscriptionSettings,
        cancel: Arc<CancelSignal>,
    ) -> Result<Self> {
        let (item_tx, items) = bounded(settings.max_buffer_size.max(1));
        let (drop_tx, dropped) = bounded(1);

        // A callback blocked on a full buffer gives up once cancelled; the
        // store requeues whatever the stopped consumer had in flight.
        let cancelled = cancel.receiver.clone();
        let on_delivery: DeliveryHandler = Arc::new(move |delivery: PersistentDelivery| {
            let message = PersistentMessage::from(delivery);
            select! {
                send(item_tx, message) -> _ => {}
                recv(cancelled) -> _ => {}
            }
        });
        let on_dropped: DropHandler = Arc::new(move |reason: DropReason| {
            let _ = drop_tx.try_send(reason);
        });

        let control = client
            .subscribe_persistent(
                PersistentRequest {
                    stream: settings.stream.clone(),
                    group: settings.group.clone(),
                    buffer_size: settings.max_buffer_size.max(1),
                },
                on_delivery,
                on_dropped,
            )
            .await?;

        cancel.attach(control);

        Ok(Self {
            settings: settings.clone(),
            items,
            dropped,
            pending_drop: Arc::new(Mutex::new(None)),
            cancel,
        })
    }

    /// Next delivery; `Ok(None)` after cancellation.
    async fn move_next(&self) -> Result<Option<PersistentMessage>> {
        let items = self.items.clone();
        let dropped = self.dropped.clone();
        let pending_drop = Arc::clone(&self.pending_drop);
        let cancel = Arc::clone(&self.cancel);

        let next = tokio::task::spawn_blocking(move || {
            wait_next(&items, &dropped, &pending_drop, &cancel)
        })
        .await?;

        match next {
            Next::Item(item) => Ok(Some(item)),
            Next::Cancelled => Ok(None),
            Next::Dropped(reason) => Err(JournalError::PersistentSubscriptionDropped {
                stream: self.settings.stream.clone(),
                group: self.settings.group.clone(),
                reason,
            }),
        }
    }
}

impl Drop for Enumerator {
    fn drop(&mut self) {
        self.cancel.detach();
    }
}

/// Running consumer-group subscription.
///
/// Pull it as a [`Stream`]; dropping it or calling [`cancel`](Self::cancel)
/// stops the store subscription.
pub struct PersistentSubscription {
    inner: BoxStream<'static, Result<PersistentMessage>>,
    cancel: Arc<CancelSignal>,
}

impl PersistentSubscription {
    /// Start the subscription. Nothing is issued to the store until first poll.
    pub fn start(
        client: Arc<dyn EventStoreClient>,
        settings: PersistentSubscriptionSettings,
    ) -> Self {
        let cancel = Arc::new(CancelSignal::new());
        let inner = run(client, settings, Arc::clone(&cancel));
        Self { inner, cancel }
    }

    /// Stop delivering and leave the consumer group. The stream completes
    /// at the next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for PersistentSubscription {
    type Item = Result<PersistentMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for PersistentSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn run(
    client: Arc<dyn EventStoreClient>,
    settings: PersistentSubscriptionSettings,
    cancel: Arc<CancelSignal>,
) -> BoxStream<'static, Result<PersistentMessage>> {
    Box::pin(try_stream! {
        let mut restarts = settings.restart.as_ref().map(RestartSettings::tracker);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let failure = match Enumerator::open(&client, &settings, Arc::clone(&cancel)).await {
                Ok(enumerator) => {
                    info!(
                        stream = %settings.stream,
                        group = %settings.group,
                        "persistent subscription opened"
                    );
                    let mut failure = None;
                    loop {
                        match enumerator.move_next().await {
                            Ok(Some(message)) => yield message,
                            Ok(None) => break,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    failure
                }
                Err(e) => Some(e),
            };

            let error = match failure {
                Some(error) => error,
                None => break,
            };

            let delay = match restarts.as_mut().and_then(|tracker| tracker.next_delay()) {
                Some(delay) => delay,
                None => {
                    warn!(
                        stream = %settings.stream,
                        group = %settings.group,
                        %error,
                        "persistent subscription failed"
                    );
                    Err::<(), _>(error)?;
                    break;
                }
            };

            warn!(
                stream = %settings.stream,
                group = %settings.group,
                %error,
                ?delay,
                "persistent subscription dropped, restarting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }

        debug!(
            stream = %settings.stream,
            group = %settings.group,
            "persistent subscription stopped"
        );
    })
}
