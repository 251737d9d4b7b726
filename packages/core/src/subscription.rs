use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::types::{CandidateId, Payload};

/// An event subscription registered with a manager.
///
/// `(origin, id)` identifies a subscription across the cluster: `id` is only
/// monotonic within the process named by `origin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscription {
    pub id: u64,
    /// Node id of the process that created the subscription.
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub event_name: String,
    #[serde(default)]
    pub context: CallContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Payload>,
    /// Manager that accepted the subscription in this process. Lookup key
    /// only; dropped on serialization.
    #[serde(skip)]
    pub owner: Option<CandidateId>,
}

impl EventSubscription {
    #[must_use]
    pub fn new(id: u64, origin: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id,
            origin: origin.into(),
            client_id: None,
            event_name: event_name.into(),
            context: CallContext::default(),
            additional_data: None,
            owner: None,
        }
    }

    /// Cluster-unique key of this subscription.
    #[must_use]
    pub fn key(&self) -> (String, u64) {
        (self.origin.clone(), self.id)
    }

    #[must_use]
    pub fn with_owner(mut self, owner: CandidateId) -> Self {
        self.owner = Some(owner);
        self
    }
}
