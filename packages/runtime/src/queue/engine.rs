//! Scheduled queue engine.
//!
//! Drives entries through `ready -> running -> {done, failed, canceled}`.
//! Execution always goes through the dispatch pipeline. Failures of any kind
//! are recorded on the entry and logged; nothing here ever surfaces an error
//! to the code that enqueued the entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use switchboard_core::{
    calculate_next_run_within, next_interval_run, CallContext, CandidateId, ClockSource,
    EntryState, Payload, QueueEntry,
};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::drain::DrainController;
use super::store::{EntryFilter, QueueStore};
use super::sweeper::{BackgroundWorker, QueueSweeper, SweepTask};
use crate::config::CoreConfig;
use crate::dispatch::{DispatchPipeline, DispatchRequest};
use crate::error::CoreError;
use crate::manager::LifecycleContext;
use crate::registry::CandidateRegistry;
use crate::resolver;

pub struct QueueEngine {
    config: Arc<CoreConfig>,
    queues: CandidateRegistry<dyn QueueStore>,
    pipeline: Mutex<DispatchPipeline>,
    clock: Arc<dyn ClockSource>,
    drains: DashMap<CandidateId, Arc<DrainController>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<BackgroundWorker<QueueSweeper>>>,
    shutting_down: AtomicBool,
}

impl QueueEngine {
    #[must_use]
    pub fn new(
        config: Arc<CoreConfig>,
        pipeline: DispatchPipeline,
        clock: Arc<dyn ClockSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queues: CandidateRegistry::new(),
            pipeline: Mutex::new(pipeline),
            clock,
            drains: DashMap::new(),
            timers: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn check_running(&self) -> Result<(), CoreError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        Ok(())
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    // -- queue registration -------------------------------------------------

    /// Registers and initializes a queue store, then recovers its due
    /// `ready` entries.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShuttingDown`] during shutdown, [`CoreError::Persistence`]
    /// when the store fails to initialize (it is not registered then).
    pub async fn add_queue(self: &Arc<Self>, store: Arc<dyn QueueStore>) -> Result<CandidateId, CoreError> {
        self.check_running()?;

        let id = self.queues.add(Arc::clone(&store));
        self.drains.insert(id, Arc::new(DrainController::new()));

        let ctx = LifecycleContext {
            config: Arc::clone(&self.config),
            id,
        };
        if let Err(err) = store.init(&ctx).await {
            self.queues.remove(id);
            self.drains.remove(&id);
            return Err(CoreError::Persistence(err));
        }

        self.ensure_sweeper();
        let recovered = self.sweep(SweepTask::Queue(id)).await;
        info!(queue = store.name(), id = %id, recovered, "queue added");
        Ok(id)
    }

    /// Drains and stops a queue store, then unregisters it.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCandidate`] if `id` is not registered.
    pub async fn remove_queue(&self, id: CandidateId) -> Result<(), CoreError> {
        let store = self.queues.remove(id).ok_or(CoreError::UnknownCandidate(id))?;
        if let Some((_, drain)) = self.drains.remove(&id) {
            self.drain_and_stop(&store, &drain).await;
        }
        info!(queue = store.name(), id = %id, "queue removed");
        Ok(())
    }

    async fn drain_and_stop(&self, store: &Arc<dyn QueueStore>, drain: &DrainController) {
        drain.trigger_drain();
        if !drain.wait_for_drain(self.config.drain_timeout).await {
            warn!(
                queue = store.name(),
                in_flight = drain.in_flight_count(),
                "drain timed out"
            );
        }
        if let Err(err) = store.stop().await {
            warn!(queue = store.name(), error = %err, "queue stop failed");
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let runnable = QueueSweeper::new(Arc::downgrade(self));
            *sweeper = Some(BackgroundWorker::start(runnable, self.config.sweep_interval));
        }
    }

    // -- enqueue --------------------------------------------------------------

    /// Persists a new entry and schedules its first attempt.
    ///
    /// Caller-supplied id and response are discarded and the state is forced
    /// to `ready`. The entry runs right away unless its `start_date` lies in
    /// the future, in which case a timer attempts it when due.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidEntry`] for a malformed entry,
    /// [`CoreError::Arbitration`] when no queue accepts it,
    /// [`CoreError::Persistence`] when the store fails to persist it.
    pub async fn enqueue(self: &Arc<Self>, entry: QueueEntry) -> Result<QueueEntry, CoreError> {
        self.check_running()?;
        entry.validate()?;

        let mut entry = entry;
        entry.id = None;
        entry.response = None;
        entry.state = EntryState::Ready;

        let snapshot = self.queues.snapshot();
        let entry_ref = &entry;
        let owner = resolver::resolve(&snapshot, |store| async move {
            store.is_responsible(entry_ref).await
        })
        .await?;

        let persisted = owner
            .candidate
            .enqueue(entry)
            .await
            .map_err(CoreError::Persistence)?;
        debug!(
            entry = persisted.id.as_deref().unwrap_or_default(),
            service = %persisted.service_name,
            queue = owner.candidate.name(),
            start = ?persisted.start_date,
            "entry enqueued"
        );

        self.schedule_attempt(owner.id, persisted.clone());
        Ok(persisted)
    }

    fn schedule_attempt(self: &Arc<Self>, queue: CandidateId, entry: QueueEntry) {
        let now = self.clock.now();
        let delay = entry
            .start_date
            .filter(|start| *start > now)
            .and_then(|start| (start - now).to_std().ok());

        let handle = match delay {
            None => {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.attempt(queue, entry).await })
            }
            Some(delay) => {
                let engine = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(engine) = engine.upgrade() {
                        engine.attempt(queue, entry).await;
                    }
                })
            }
        };

        let mut timers = self.timers.lock();
        timers.retain(|h| !h.is_finished());
        timers.push(handle);
    }

    // -- execution ------------------------------------------------------------

    /// Claims and runs one entry. A lost claim silently ends the attempt.
    async fn attempt(self: Arc<Self>, queue: CandidateId, entry: QueueEntry) {
        let Some(store) = self.queues.get(queue) else {
            debug!(queue = %queue, "queue gone, attempt dropped");
            return;
        };
        let Some(drain) = self.drains.get(&queue).map(|d| Arc::clone(d.value())) else {
            return;
        };
        let Some(_guard) = drain.try_acquire() else {
            debug!(queue = store.name(), "queue draining, attempt skipped");
            return;
        };

        let claimed = match store.try_take(&entry).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(entry = entry.id.as_deref().unwrap_or_default(), "claim lost");
                return;
            }
            Err(err) => {
                warn!(
                    queue = store.name(),
                    entry = entry.id.as_deref().unwrap_or_default(),
                    error = %err,
                    "claim failed"
                );
                return;
            }
        };

        self.start(queue, &store, claimed).await;
    }

    async fn start(self: &Arc<Self>, queue: CandidateId, store: &Arc<dyn QueueStore>, claimed: QueueEntry) {
        let mut entry = match store.on_before_start(claimed.clone()).await {
            Ok(enriched) => enriched,
            Err(err) => {
                warn!(queue = store.name(), error = %err, "on_before_start failed, running unenriched");
                claimed
            }
        };

        let started_at = self.clock.now();
        entry.start_date.get_or_insert(started_at);
        entry.state = EntryState::Running;
        match store.update_if_state(&entry, EntryState::Running).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    entry = entry.id.as_deref().unwrap_or_default(),
                    "canceled or removed before start, not executed"
                );
                return;
            }
            Err(err) => {
                error!(
                    queue = store.name(),
                    entry = entry.id.as_deref().unwrap_or_default(),
                    error = %err,
                    "failed to record start"
                );
            }
        }

        let ctx = match store.get_execution_context(&entry).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(queue = store.name(), error = %err, "no execution context, using node default");
                CallContext::for_node(self.config.node_id.clone())
            }
        };

        let pipeline = self.pipeline.lock().clone();
        let request = DispatchRequest::new(entry.service_name.clone(), entry.request.clone(), ctx);
        let outcome = pipeline.oneshot(request).await;

        entry.end_date = Some(self.clock.now());
        match outcome {
            Ok(response) => {
                entry.state = EntryState::Done;
                entry.response = Some(response);
            }
            Err(err) => {
                warn!(
                    entry = entry.id.as_deref().unwrap_or_default(),
                    service = %entry.service_name,
                    error = %err,
                    "queued execution failed"
                );
                entry.state = EntryState::Failed;
                entry.response = Some(Payload::String(err.to_string()));
            }
        }

        if record_outcome(store, &mut entry).await {
            self.reschedule(queue, store, entry).await;
        }
    }

    // -- rescheduling -----------------------------------------------------------

    /// Instant of the next occurrence of a finished repeating entry.
    fn next_occurrence(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last_attempt = entry.start_date.unwrap_or(now);
        if let Some(secs) = entry.interval {
            return next_interval_run(last_attempt, secs).map(|next| next.max(now));
        }
        let schedule = entry.recurring.as_ref()?;
        let horizon = self.config.search_horizon_years;
        match calculate_next_run_within(schedule, last_attempt, horizon) {
            Some(next) if next < now => calculate_next_run_within(schedule, now, horizon),
            other => other,
        }
    }

    async fn reschedule(self: &Arc<Self>, queue: CandidateId, store: &Arc<dyn QueueStore>, mut entry: QueueEntry) {
        if !entry.repeats() {
            return;
        }

        let now = self.clock.now();
        if entry.end_of_interval.is_some_and(|end| end <= now) {
            let finished = entry.state;
            entry.state = EntryState::Canceled;
            if let Err(err) = store.update_if_state(&entry, finished).await {
                error!(queue = store.name(), error = %err, "failed to cancel expired entry");
            }
            debug!(entry = entry.id.as_deref().unwrap_or_default(), "end of interval reached");
            return;
        }

        let Some(next) = self.next_occurrence(&entry, now) else {
            debug!(entry = entry.id.as_deref().unwrap_or_default(), "no further occurrence");
            return;
        };
        if entry.end_of_interval.is_some_and(|end| next > end) {
            debug!(entry = entry.id.as_deref().unwrap_or_default(), "next occurrence past end of interval");
            return;
        }

        let mut copy = match store.copy_entry(&entry).await {
            Ok(copy) => copy,
            Err(err) => {
                error!(queue = store.name(), error = %err, "failed to copy repeating entry");
                return;
            }
        };
        copy.id = None;
        copy.response = None;
        copy.end_date = None;
        copy.start_date = Some(next);
        copy.state = EntryState::Ready;

        match store.enqueue(copy).await {
            Ok(persisted) => {
                debug!(
                    previous = entry.id.as_deref().unwrap_or_default(),
                    next_entry = persisted.id.as_deref().unwrap_or_default(),
                    at = %next,
                    "next occurrence enqueued"
                );
                self.schedule_attempt(queue, persisted);
            }
            Err(err) => {
                error!(queue = store.name(), error = %err, "failed to enqueue next occurrence");
            }
        }
    }

    // -- sweeping ---------------------------------------------------------------

    /// Attempts every due `ready` entry in the selected queues.
    ///
    /// Returns how many attempts were started. Attempts run in the
    /// background; duplicates with pending timers lose the claim harmlessly.
    pub async fn sweep(self: &Arc<Self>, task: SweepTask) -> usize {
        if self.shutting_down.load(Ordering::Acquire) {
            return 0;
        }
        let targets: Vec<_> = self
            .queues
            .snapshot()
            .iter()
            .filter(|r| task == SweepTask::All || task == SweepTask::Queue(r.id))
            .cloned()
            .collect();

        let now = self.clock.now();
        let ready = EntryFilter::all().in_state(EntryState::Ready);
        let mut started = 0;
        for target in targets {
            let entries = match target.candidate.get_entries(&ready).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(queue = target.candidate.name(), error = %err, "sweep failed to list entries");
                    continue;
                }
            };
            let queue = target.id;
            for entry in entries.into_iter().filter(|e| e.is_due(now)) {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.attempt(queue, entry).await });
                started += 1;
            }
        }
        if started > 0 {
            debug!(started, "sweep started attempts");
        }
        started
    }

    /// Asks the background sweeper to sweep soon, without waiting.
    pub fn request_sweep(&self, task: SweepTask) {
        if let Some(sweeper) = self.sweeper.lock().as_ref() {
            if let Err(err) = sweeper.try_submit(task) {
                debug!(error = %err, "sweep request dropped");
            }
        }
    }

    // -- entry management ---------------------------------------------------------

    /// Entries matching `filter` across every queue.
    ///
    /// # Errors
    ///
    /// [`CoreError::Persistence`] when any store fails to list.
    pub async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<QueueEntry>, CoreError> {
        let snapshot = self.queues.snapshot();
        let results = join_all(snapshot.iter().map(|r| r.candidate.get_entries(filter))).await;
        let mut entries = Vec::new();
        for result in results {
            entries.extend(result.map_err(CoreError::Persistence)?);
        }
        Ok(entries)
    }

    /// Deletes matching entries from every queue.
    ///
    /// # Errors
    ///
    /// [`CoreError::Persistence`] when any store fails to delete.
    pub async fn remove_entries(&self, filter: &EntryFilter) -> Result<usize, CoreError> {
        let snapshot = self.queues.snapshot();
        let results = join_all(snapshot.iter().map(|r| r.candidate.remove_entries(filter))).await;
        let mut removed = 0;
        for result in results {
            removed += result.map_err(CoreError::Persistence)?;
        }
        Ok(removed)
    }

    /// Marks matching `ready` and `running` entries canceled.
    ///
    /// A running entry finishes its current execution but is not
    /// rescheduled; one still in `on_before_start` is not executed at all.
    /// Only the state and end date are written, through the store's
    /// conditional cancel.
    ///
    /// # Errors
    ///
    /// [`CoreError::Persistence`] when any store fails.
    pub async fn cancel(&self, filter: &EntryFilter) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let mut canceled = 0;
        for registered in self.queues.snapshot().iter() {
            let store = &registered.candidate;
            let entries = store.get_entries(filter).await.map_err(CoreError::Persistence)?;
            for entry in entries
                .iter()
                .filter(|e| matches!(e.state, EntryState::Ready | EntryState::Running))
            {
                if store.cancel_entry(entry, now).await.map_err(CoreError::Persistence)? {
                    canceled += 1;
                }
            }
        }
        Ok(canceled)
    }

    // -- shutdown -------------------------------------------------------------------

    /// Stops accepting work, waits for in-flight entries, stops every store
    /// and releases them.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for drain in self.drains.iter() {
            drain.value().trigger_drain();
        }

        let queues = self.queues.snapshot();
        join_all(queues.iter().filter_map(|registered| {
            let drain = self.drains.get(&registered.id).map(|d| Arc::clone(d.value()))?;
            Some(async move { self.drain_and_stop(&registered.candidate, &drain).await })
        }))
        .await;

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop().await;
        }

        let released = self.queues.clear();
        self.drains.clear();
        info!(queues = released.len(), "queue engine shut down");
    }

    /// How long shutdown waits for in-flight work.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        self.config.drain_timeout
    }
}

/// Persists the outcome, unless the entry left `running` meanwhile.
///
/// Returns `true` when the chain should continue. An entry canceled
/// while it ran keeps its `canceled` state with the response attached;
/// a removed entry is dropped. A failed write is logged and the chain
/// continues.
async fn record_outcome(store: &Arc<dyn QueueStore>, entry: &mut QueueEntry) -> bool {
    match store.update_if_state(entry, EntryState::Running).await {
        Ok(true) => {}
        Ok(false) => {
            settle_interrupted(store, entry).await;
            return false;
        }
        Err(err) => error!(
            queue = store.name(),
            entry = entry.id.as_deref().unwrap_or_default(),
            state = %entry.state,
            response = ?entry.response,
            error = %err,
            "failed to record outcome"
        ),
    }
    count_execution(entry.state);
    true
}

/// Handles an entry that left `running` while it executed.
async fn settle_interrupted(store: &Arc<dyn QueueStore>, entry: &mut QueueEntry) {
    match store.refresh_entry(entry).await {
        Ok(Some(current)) if current.state == EntryState::Canceled => {
            entry.state = EntryState::Canceled;
            count_execution(entry.state);
            if let Err(err) = store.update_if_state(entry, EntryState::Canceled).await {
                error!(queue = store.name(), error = %err, "failed to record canceled outcome");
            }
            debug!(entry = entry.id.as_deref().unwrap_or_default(), "canceled while running");
        }
        Ok(Some(current)) => debug!(
            entry = entry.id.as_deref().unwrap_or_default(),
            state = %current.state,
            "entry left running elsewhere, outcome dropped"
        ),
        Ok(None) => debug!(entry = entry.id.as_deref().unwrap_or_default(), "removed while running"),
        Err(err) => error!(queue = store.name(), error = %err, "failed to re-read entry after execution"),
    }
}

fn count_execution(state: EntryState) {
    metrics::counter!("switchboard_queue_executions_total", "state" => state.as_str()).increment(1);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
