//! Subscriber-side types for catch-up subscriptions.

use crate::client::SubscriptionEvent;
use tokio::sync::mpsc;

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// An event tagged with the stream it came from.
#[derive(Clone, Debug)]
pub struct SubscriberEvent {
    pub stream: String,
    pub event: SubscriptionEvent,
}

/// A consumer of catch-up subscription events.
///
/// The subscriber is alive as long as its [`SubscriberHandle`] (the
/// receiving end) exists.
#[derive(Clone, Debug)]
pub struct Subscriber {
    pub(crate) id: SubscriberId,
    pub(crate) sender: mpsc::UnboundedSender<SubscriberEvent>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// False once the receiving end is gone.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Receiving end of a subscriber.
#[derive(Debug)]
pub struct SubscriberHandle {
    pub subscriber: Subscriber,
    /// Buffer of received events, drained on demand.
    pub receiver: mpsc::UnboundedReceiver<SubscriberEvent>,
}

impl SubscriberHandle {
    /// Receive the next event.
    pub async fn recv(&mut self) -> Option<SubscriberEvent> {
        self.receiver.recv().await
    }
}

/// Whether a catch-up query completes at the head or stays live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUpMode {
    /// Complete once caught up.
    Current,
    /// Keep delivering live records.
    Live,
}

/// Lifecycle of one catch-up query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUpPhase {
    AwaitingSubscribe,
    Replaying,
    CaughtUp,
    Completed,
    Dropped,
    Cancelled,
}
