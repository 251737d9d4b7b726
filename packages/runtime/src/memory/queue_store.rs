//! In-memory [`QueueStore`] backed by [`DashMap`].
//!
//! Claims are atomic because the state check and the transition happen
//! under the entry's shard lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use switchboard_core::{CallContext, EntryState, QueueEntry};
use tracing::debug;
use uuid::Uuid;

use crate::manager::LifecycleContext;
use crate::queue::{EntryFilter, QueueStore};

struct Stored {
    /// Insertion sequence; listing returns entries in this order.
    seq: u64,
    entry: QueueEntry,
}

pub struct MemoryQueueStore {
    name: String,
    entries: DashMap<String, Stored>,
    next_seq: AtomicU64,
    affinity: u32,
    /// When set, only these services are accepted.
    services: Option<HashSet<String>>,
    node_id: RwLock<String>,
    stopped: AtomicBool,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            affinity: 1,
            services: None,
            node_id: RwLock::new("local".to_string()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Score returned for accepted entries.
    #[must_use]
    pub fn with_affinity(mut self, affinity: u32) -> Self {
        self.affinity = affinity;
        self
    }

    /// Restricts the store to entries for the given services.
    #[must_use]
    pub fn for_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = Some(services.into_iter().map(Into::into).collect());
        self
    }

    /// Stores `entry` as-is, bypassing the engine. Returns the assigned id.
    ///
    /// Stands in for entries persisted by an earlier process.
    pub fn insert_raw(&self, mut entry: QueueEntry) -> String {
        let id = entry
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        entry.id = Some(id.clone());
        self.put(id.clone(), entry);
        id
    }

    fn put(&self, id: String, entry: QueueEntry) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, Stored { seq, entry });
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueueEntry> {
        self.entries.get(id).map(|s| s.entry.clone())
    }

    /// Every entry in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.collect(&EntryFilter::all())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn collect(&self, filter: &EntryFilter) -> Vec<QueueEntry> {
        let mut matching: Vec<(u64, QueueEntry)> = self
            .entries
            .iter()
            .filter(|s| filter.matches(&s.entry))
            .map(|s| (s.seq, s.entry.clone()))
            .collect();
        matching.sort_by_key(|(seq, _)| *seq);
        matching.into_iter().map(|(_, entry)| entry).collect()
    }

    fn require_id(entry: &QueueEntry) -> anyhow::Result<&str> {
        entry
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("entry has not been persisted"))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &LifecycleContext) -> anyhow::Result<()> {
        ctx.config.node_id.clone_into(&mut self.node_id.write());
        self.stopped.store(false, Ordering::Release);
        debug!(queue = %self.name, entries = self.entries.len(), "memory queue initialized");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_responsible(&self, entry: &QueueEntry) -> anyhow::Result<u32> {
        let accepted = self
            .services
            .as_ref()
            .map_or(true, |services| services.contains(&entry.service_name));
        Ok(if accepted { self.affinity } else { 0 })
    }

    async fn enqueue(&self, mut entry: QueueEntry) -> anyhow::Result<QueueEntry> {
        if self.is_stopped() {
            anyhow::bail!("queue `{}` is stopped", self.name);
        }
        let id = Uuid::new_v4().to_string();
        entry.id = Some(id.clone());
        self.put(id, entry.clone());
        Ok(entry)
    }

    async fn try_take(&self, entry: &QueueEntry) -> anyhow::Result<Option<QueueEntry>> {
        let id = Self::require_id(entry)?;
        let Some(mut stored) = self.entries.get_mut(id) else {
            return Ok(None);
        };
        if stored.entry.state != EntryState::Ready {
            return Ok(None);
        }
        stored.entry.state = EntryState::Running;
        Ok(Some(stored.entry.clone()))
    }

    async fn update_entry(&self, entry: &QueueEntry) -> anyhow::Result<()> {
        let id = Self::require_id(entry)?;
        match self.entries.get_mut(id) {
            Some(mut stored) => {
                stored.entry = entry.clone();
                Ok(())
            }
            None => anyhow::bail!("entry `{id}` does not exist"),
        }
    }

    async fn update_if_state(&self, entry: &QueueEntry, expected: EntryState) -> anyhow::Result<bool> {
        let id = Self::require_id(entry)?;
        let Some(mut stored) = self.entries.get_mut(id) else {
            return Ok(false);
        };
        if stored.entry.state != expected {
            return Ok(false);
        }
        stored.entry = entry.clone();
        Ok(true)
    }

    async fn cancel_entry(&self, entry: &QueueEntry, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let id = Self::require_id(entry)?;
        let Some(mut stored) = self.entries.get_mut(id) else {
            return Ok(false);
        };
        if stored.entry.state.is_terminal() {
            return Ok(false);
        }
        stored.entry.state = EntryState::Canceled;
        stored.entry.end_date.get_or_insert(at);
        Ok(true)
    }

    async fn refresh_entry(&self, entry: &QueueEntry) -> anyhow::Result<Option<QueueEntry>> {
        let id = Self::require_id(entry)?;
        Ok(self.get(id))
    }

    async fn get_entries(&self, filter: &EntryFilter) -> anyhow::Result<Vec<QueueEntry>> {
        Ok(self.collect(filter))
    }

    async fn remove_entries(&self, filter: &EntryFilter) -> anyhow::Result<usize> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|s| filter.matches(&s.entry))
            .map(|s| s.key().clone())
            .collect();
        Ok(ids
            .iter()
            .filter(|id| self.entries.remove(*id).is_some())
            .count())
    }

    async fn get_execution_context(&self, entry: &QueueEntry) -> anyhow::Result<CallContext> {
        let id = Self::require_id(entry)?;
        let mut ctx = CallContext::for_node(self.node_id.read().clone())
            .with_trace_id(id)
            .with_attribute("queue", json!(self.name))
            .with_attribute("queueEntryId", json!(id));
        if let Some(group) = &entry.group_id {
            ctx = ctx.with_attribute("groupId", json!(group));
        }
        Ok(ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use switchboard_core::CandidateId;

    use super::*;
    use crate::config::CoreConfig;

    fn new_entry(service: &str) -> QueueEntry {
        QueueEntry::new(service, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn enqueue_assigns_fresh_ids() {
        let store = MemoryQueueStore::new("q");
        let a = store.enqueue(new_entry("s")).await.unwrap();
        let b = store.enqueue(new_entry("s")).await.unwrap();
        assert!(a.id.is_some());
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn try_take_claims_once() {
        let store = MemoryQueueStore::new("q");
        let entry = store.enqueue(new_entry("s")).await.unwrap();

        let claimed = store.try_take(&entry).await.unwrap().unwrap();
        assert_eq!(claimed.state, EntryState::Running);
        assert!(store.try_take(&entry).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_take_ignores_terminal_entries() {
        let store = MemoryQueueStore::new("q");
        let mut entry = store.enqueue(new_entry("s")).await.unwrap();
        entry.state = EntryState::Done;
        store.update_entry(&entry).await.unwrap();
        assert!(store.try_take(&entry).await.unwrap().is_none());
        assert_eq!(store.get(entry.id.as_deref().unwrap()).unwrap().state, EntryState::Done);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryQueueStore::new("q"));
        let entry = store.enqueue(new_entry("s")).await.unwrap();

        let claims = (0..16).map(|_| {
            let store = Arc::clone(&store);
            let entry = entry.clone();
            tokio::spawn(async move { store.try_take(&entry).await.unwrap().is_some() })
        });
        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn service_filter_controls_affinity() {
        let store = MemoryQueueStore::new("q").with_affinity(3).for_services(["mail"]);
        assert_eq!(store.is_responsible(&new_entry("mail")).await.unwrap(), 3);
        assert_eq!(store.is_responsible(&new_entry("sms")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn listing_keeps_insertion_order() {
        let store = MemoryQueueStore::new("q");
        for i in 0..5 {
            store.enqueue(new_entry(&format!("s{i}"))).await.unwrap();
        }
        let names: Vec<_> = store.snapshot().into_iter().map(|e| e.service_name).collect();
        assert_eq!(names, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn conditional_update_respects_stored_state() {
        let store = MemoryQueueStore::new("q");
        let entry = store.enqueue(new_entry("s")).await.unwrap();
        let mut running = store.try_take(&entry).await.unwrap().unwrap();
        running.response = Some(json!("ok"));
        running.state = EntryState::Done;

        assert!(!store.update_if_state(&running, EntryState::Ready).await.unwrap());
        assert_eq!(store.get(entry.id.as_deref().unwrap()).unwrap().state, EntryState::Running);

        assert!(store.update_if_state(&running, EntryState::Running).await.unwrap());
        assert_eq!(store.get(entry.id.as_deref().unwrap()).unwrap(), running);
    }

    #[tokio::test]
    async fn cancel_touches_only_state_and_end_date() {
        let store = MemoryQueueStore::new("q");
        let entry = store.enqueue(new_entry("s")).await.unwrap();
        let mut running = store.try_take(&entry).await.unwrap().unwrap();
        let started = chrono::Utc::now();
        running.start_date = Some(started);
        store.update_entry(&running).await.unwrap();

        // A stale copy without the claimant's start date.
        assert!(store.cancel_entry(&entry, started).await.unwrap());
        let canceled = store.get(entry.id.as_deref().unwrap()).unwrap();
        assert_eq!(canceled.state, EntryState::Canceled);
        assert_eq!(canceled.start_date, Some(started));
        assert_eq!(canceled.end_date, Some(started));

        assert!(!store.cancel_entry(&entry, started).await.unwrap());
    }

    #[tokio::test]
    async fn remove_and_refresh() {
        let store = MemoryQueueStore::new("q");
        let keep = store.enqueue(new_entry("keep")).await.unwrap();
        let dropped = store.enqueue(new_entry("drop")).await.unwrap();

        assert_eq!(store.remove_entries(&EntryFilter::by_service("drop")).await.unwrap(), 1);
        assert!(store.refresh_entry(&dropped).await.unwrap().is_none());
        assert!(store.refresh_entry(&keep).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn execution_context_carries_node_and_entry() {
        let store = MemoryQueueStore::new("q");
        store
            .init(&LifecycleContext {
                config: Arc::new(CoreConfig::default().with_node_id("node-7")),
                id: CandidateId(1),
            })
            .await
            .unwrap();
        let entry = store.enqueue(new_entry("s").with_group("g")).await.unwrap();

        let ctx = store.get_execution_context(&entry).await.unwrap();
        assert_eq!(ctx.node_id, "node-7");
        assert_eq!(ctx.trace_id, entry.id.clone().unwrap());
        assert_eq!(ctx.attributes["groupId"], json!("g"));
    }

    #[tokio::test]
    async fn stopped_store_refuses_entries() {
        let store = MemoryQueueStore::new("q");
        store.stop().await.unwrap();
        assert!(store.enqueue(new_entry("s")).await.is_err());
    }

    #[tokio::test]
    async fn copy_entry_resets_run_state() {
        let store = MemoryQueueStore::new("q");
        let mut entry = store.enqueue(new_entry("s").every(5)).await.unwrap();
        entry.state = EntryState::Done;
        entry.response = Some(json!("ok"));

        let copy = store.copy_entry(&entry).await.unwrap();
        assert!(copy.id.is_none());
        assert!(copy.response.is_none());
        assert_eq!(copy.state, EntryState::Ready);
        assert_eq!(copy.interval, Some(5));
    }
}
