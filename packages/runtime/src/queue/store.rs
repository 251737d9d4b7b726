//! The queue store contract.
//!
//! A queue store persists entries and is the single source of truth for
//! their state. The engine never caches entries across an execution: every
//! write made by a claimant is conditional on the stored state, so a
//! concurrent cancellation is never overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use switchboard_core::{CallContext, EntryState, QueueEntry};

use crate::manager::LifecycleContext;

/// Selects entries for listing, removal and cancellation.
///
/// Unset fields match everything; set fields must all match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    pub ids: Option<Vec<String>>,
    pub service_name: Option<String>,
    pub group_id: Option<String>,
    pub state: Option<EntryState>,
}

impl EntryFilter {
    /// Matches every entry.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: Some(vec![id.into()]),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: Some(service_name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_state(mut self, state: EntryState) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn matches(&self, entry: &QueueEntry) -> bool {
        if let Some(ids) = &self.ids {
            if !entry.id.as_ref().is_some_and(|id| ids.contains(id)) {
                return false;
            }
        }
        if self
            .service_name
            .as_ref()
            .is_some_and(|name| name != &entry.service_name)
        {
            return false;
        }
        if self
            .group_id
            .as_ref()
            .is_some_and(|group| entry.group_id.as_ref() != Some(group))
        {
            return false;
        }
        self.state.map_or(true, |state| state == entry.state)
    }
}

/// A persistent queue competing for entries.
///
/// Implementations must make [`try_take`](Self::try_take) atomic: of any
/// number of concurrent claimants for the same `ready` entry, exactly one
/// receives it.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once in-flight entries of this queue have drained.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Affinity for persisting `entry`.
    async fn is_responsible(&self, entry: &QueueEntry) -> anyhow::Result<u32>;

    /// Persists a new entry, assigning its id.
    async fn enqueue(&self, entry: QueueEntry) -> anyhow::Result<QueueEntry>;

    /// Claims `entry` (`ready -> running`). `None` when it was not `ready`.
    async fn try_take(&self, entry: &QueueEntry) -> anyhow::Result<Option<QueueEntry>>;

    /// Overwrites the stored form of `entry`.
    async fn update_entry(&self, entry: &QueueEntry) -> anyhow::Result<()>;

    /// Overwrites the stored form of `entry` only while the stored state is
    /// still `expected`.
    ///
    /// Returns `false` when the state has moved on or the entry is gone.
    /// Must be atomic, like [`try_take`](Self::try_take).
    async fn update_if_state(&self, entry: &QueueEntry, expected: EntryState) -> anyhow::Result<bool>;

    /// Marks a `ready` or `running` entry `canceled`, stamping `end_date`
    /// with `at` if unset. Every other stored field is left alone.
    ///
    /// Returns `false` when the entry is gone or already terminal.
    async fn cancel_entry(&self, entry: &QueueEntry, at: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Current stored form of `entry`, or `None` if it no longer exists.
    async fn refresh_entry(&self, entry: &QueueEntry) -> anyhow::Result<Option<QueueEntry>>;

    /// Template for the next occurrence of a repeating entry.
    async fn copy_entry(&self, entry: &QueueEntry) -> anyhow::Result<QueueEntry> {
        Ok(entry.fresh_copy())
    }

    async fn get_entries(&self, filter: &EntryFilter) -> anyhow::Result<Vec<QueueEntry>>;

    /// Deletes matching entries, returning how many were removed.
    async fn remove_entries(&self, filter: &EntryFilter) -> anyhow::Result<usize>;

    /// Context an entry executes under.
    async fn get_execution_context(&self, entry: &QueueEntry) -> anyhow::Result<CallContext>;

    /// Enrichment hook run on a claimed entry right before execution.
    async fn on_before_start(&self, entry: QueueEntry) -> anyhow::Result<QueueEntry> {
        Ok(entry)
    }
}
