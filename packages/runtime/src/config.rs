use std::time::Duration;

use switchboard_core::DEFAULT_SEARCH_YEARS;

/// Process-level configuration for the orchestration core.
///
/// Controls queue sweeping, shutdown draining, dispatch timeouts and relay
/// channel sizing.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Identifier of this process. Stamped on subscriptions as their origin
    /// and on execution contexts built by the in-memory stores.
    pub node_id: String,
    /// How often due `ready` entries are swept from every queue store.
    /// `None` disables the sweeper; timers and startup recovery still run.
    pub sweep_interval: Option<Duration>,
    /// Upper bound on how long shutdown waits for in-flight entries.
    pub drain_timeout: Duration,
    /// Optional cap on a single dispatched execution.
    pub execute_timeout: Option<Duration>,
    /// Bounded mpsc capacity of each relay channel.
    pub relay_channel_capacity: usize,
    /// Years the recurrence search looks ahead before giving up.
    pub search_horizon_years: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            sweep_interval: Some(Duration::from_secs(5)),
            drain_timeout: Duration::from_secs(30),
            execute_timeout: None,
            relay_channel_capacity: 256,
            search_horizon_years: DEFAULT_SEARCH_YEARS,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}
