//! Cross-process relay peers.
//!
//! A communicator forwards events and subscription changes to peer
//! processes sharing the same logical scope. It relays; it never owns
//! subscriptions.

use async_trait::async_trait;
use switchboard_core::{
    CallContext, EventPayload, EventSubscription, Payload, RelayMessage, SubscriptionPayload,
};
use tokio::sync::mpsc;

#[async_trait]
pub trait Communicator: Send + Sync + 'static {
    /// Forwards an emitted event to peers.
    async fn broadcast_event(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()>;

    /// Announces a new subscription to peers.
    async fn broadcast_subscription(&self, subscription: &EventSubscription) -> anyhow::Result<()>;

    /// Announces a removed subscription to peers.
    async fn broadcast_unsubscription(&self, subscription: &EventSubscription) -> anyhow::Result<()>;
}

/// Converts a communicator call into its relay message.
pub(crate) fn event_message(event: &Payload, name: &str, ctx: &CallContext) -> RelayMessage {
    RelayMessage::Event(EventPayload {
        name: name.to_string(),
        event: event.clone(),
        context: ctx.clone(),
    })
}

pub(crate) fn subscribe_message(subscription: &EventSubscription) -> RelayMessage {
    RelayMessage::Subscribe(SubscriptionPayload {
        subscription: wire_subscription(subscription),
    })
}

pub(crate) fn unsubscribe_message(subscription: &EventSubscription) -> RelayMessage {
    RelayMessage::Unsubscribe(SubscriptionPayload {
        subscription: wire_subscription(subscription),
    })
}

/// The owner back-reference is process-local and never leaves the process.
fn wire_subscription(subscription: &EventSubscription) -> EventSubscription {
    EventSubscription {
        owner: None,
        ..subscription.clone()
    }
}

// ---------------------------------------------------------------------------
// ChannelCommunicator
// ---------------------------------------------------------------------------

/// Communicator that hands every relay message to an unbounded channel.
///
/// Lets an external transport drain outbound messages from the receiver.
#[derive(Debug, Clone)]
pub struct ChannelCommunicator {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl ChannelCommunicator {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: RelayMessage) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("relay channel closed"))
    }
}

#[async_trait]
impl Communicator for ChannelCommunicator {
    async fn broadcast_event(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()> {
        self.send(event_message(event, name, ctx))
    }

    async fn broadcast_subscription(&self, subscription: &EventSubscription) -> anyhow::Result<()> {
        self.send(subscribe_message(subscription))
    }

    async fn broadcast_unsubscription(&self, subscription: &EventSubscription) -> anyhow::Result<()> {
        self.send(unsubscribe_message(subscription))
    }
}
