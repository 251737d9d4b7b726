use serde::{Deserialize, Serialize};

use crate::types::Payload;

/// Per-call context carrying identity and tracing information.
///
/// Threaded through every manager call. Queue stores build one per entry
/// (`get_execution_context`), transports build one per inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Identifier of the node handling the call.
    pub node_id: String,
    /// Client on whose behalf the call runs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Distributed trace identifier for observability.
    #[serde(default)]
    pub trace_id: String,
    /// Free-form attributes set by transports or queue stores.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, Payload>,
}

impl CallContext {
    /// Creates a context for the given node with no client and no attributes.
    #[must_use]
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Payload) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}
