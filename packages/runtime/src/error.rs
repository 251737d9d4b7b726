//! Error taxonomy of the orchestration core.

use switchboard_core::{CandidateId, EntryError};

/// No candidate could be chosen for a request, event or entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbitrationError {
    #[error("no candidates registered")]
    NoCandidates,
    #[error("no candidate is responsible")]
    NoResponsibleCandidate,
}

/// Errors surfaced by the core to interactive callers.
///
/// Queue-driven executions never return these; their failures are recorded
/// on the entry instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),
    #[error("subscription rejected: {reason}")]
    Authorization { reason: String },
    #[error("execution failed: {0}")]
    Execution(#[source] anyhow::Error),
    #[error("persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("invalid queue entry: {0}")]
    InvalidEntry(#[from] EntryError),
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("unknown candidate: {0}")]
    UnknownCandidate(CandidateId),
    #[error("shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Builds an authorization rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Arbitration(_) => "arbitration",
            Self::Authorization { .. } => "authorization",
            Self::Execution(_) => "execution",
            Self::Persistence(_) => "persistence",
            Self::InvalidEntry(_) => "invalid_entry",
            Self::Timeout { .. } => "timeout",
            Self::UnknownCandidate(_) => "unknown_candidate",
            Self::ShuttingDown => "shutting_down",
        }
    }
}
