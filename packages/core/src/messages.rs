//! Messages exchanged between worker processes through a relay.
//!
//! Only the shape is defined here; how an envelope is framed and encoded on
//! a real transport belongs to the transport collaborator.

use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::subscription::EventSubscription;
use crate::types::{Payload, WorkerId};

/// One relayed bus operation.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    Event(EventPayload),
    Subscribe(SubscriptionPayload),
    Unsubscribe(SubscriptionPayload),
}

impl RelayMessage {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub name: String,
    pub event: Payload,
    pub context: CallContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    pub subscription: EventSubscription,
}

/// A relay message stamped with the worker it came from, so the coordinator
/// can skip the sender when fanning out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub origin: WorkerId,
    pub message: RelayMessage,
}

impl RelayEnvelope {
    #[must_use]
    pub fn new(origin: WorkerId, message: RelayMessage) -> Self {
        Self { origin, message }
    }
}
