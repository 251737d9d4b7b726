//! Process-wide coordinator owning every candidate registry.
//!
//! A [`Switchboard`] is built once per process and shared as
//! `Arc<Switchboard>`. It wires the dispatcher, the event bus and the queue
//! engine to the same manager registry and exposes one entry point for each
//! operation of the core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::{
    CallContext, CandidateId, ClockSource, EventSubscription, Payload, QueueEntry, SystemClock,
    WorkerId,
};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{info, warn};

use crate::bus::{EventBus, SubscribeTarget};
use crate::communicator::Communicator;
use crate::config::CoreConfig;
use crate::dispatch::{build_dispatch_pipeline, DispatchPipeline, DispatchRequest, DispatchStream, Dispatcher};
use crate::error::CoreError;
use crate::manager::{EventHandler, LifecycleContext, Manager};
use crate::queue::{EntryFilter, QueueEngine, QueueStore, SweepTask};
use crate::registry::CandidateRegistry;
use crate::relay::ClusterRelay;

pub struct Switchboard {
    config: Arc<CoreConfig>,
    managers: Arc<CandidateRegistry<dyn Manager>>,
    communicators: Arc<CandidateRegistry<dyn Communicator>>,
    dispatcher: Dispatcher,
    pipeline: Mutex<DispatchPipeline>,
    bus: Arc<EventBus>,
    queues: Arc<QueueEngine>,
    shutting_down: AtomicBool,
}

impl Switchboard {
    /// Builds a coordinator reading time from the system clock.
    #[must_use]
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: CoreConfig, clock: Arc<dyn ClockSource>) -> Arc<Self> {
        let config = Arc::new(config);
        let managers: Arc<CandidateRegistry<dyn Manager>> = Arc::new(CandidateRegistry::new());
        let communicators: Arc<CandidateRegistry<dyn Communicator>> = Arc::new(CandidateRegistry::new());

        let dispatcher = Dispatcher::new(Arc::clone(&managers));
        let pipeline = build_dispatch_pipeline(dispatcher.clone(), config.execute_timeout);
        let bus = Arc::new(EventBus::new(
            config.node_id.clone(),
            Arc::clone(&managers),
            Arc::clone(&communicators),
        ));
        let queues = QueueEngine::new(Arc::clone(&config), pipeline.clone(), clock);

        info!(node = %config.node_id, "switchboard created");
        Arc::new(Self {
            config,
            managers,
            communicators,
            dispatcher,
            pipeline: Mutex::new(pipeline),
            bus,
            queues,
            shutting_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn queue_engine(&self) -> Arc<QueueEngine> {
        Arc::clone(&self.queues)
    }

    fn check_running(&self) -> Result<(), CoreError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        Ok(())
    }

    // -- managers -------------------------------------------------------------

    /// Registers and initializes a manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShuttingDown`] during shutdown, [`CoreError::Execution`]
    /// when `init` fails (the manager is not registered then).
    pub async fn add_manager(&self, manager: Arc<dyn Manager>) -> Result<CandidateId, CoreError> {
        self.check_running()?;
        let id = self.managers.add(Arc::clone(&manager));
        let ctx = LifecycleContext {
            config: Arc::clone(&self.config),
            id,
        };
        if let Err(err) = manager.init(&ctx).await {
            self.managers.remove(id);
            return Err(CoreError::Execution(err));
        }
        info!(manager = manager.name(), id = %id, "manager added");
        Ok(id)
    }

    /// Unregisters and terminates a manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCandidate`] if `id` is not registered.
    pub async fn remove_manager(&self, id: CandidateId) -> Result<(), CoreError> {
        let manager = self.managers.remove(id).ok_or(CoreError::UnknownCandidate(id))?;
        terminate(manager.as_ref()).await;
        info!(manager = manager.name(), id = %id, "manager removed");
        Ok(())
    }

    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    // -- queues ---------------------------------------------------------------

    /// Registers a queue store and recovers its due entries.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::add_queue`].
    pub async fn add_queue(&self, store: Arc<dyn QueueStore>) -> Result<CandidateId, CoreError> {
        self.check_running()?;
        self.queues.add_queue(store).await
    }

    /// Drains, stops and unregisters a queue store.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCandidate`] if `id` is not registered.
    pub async fn remove_queue(&self, id: CandidateId) -> Result<(), CoreError> {
        self.queues.remove_queue(id).await
    }

    // -- communicators --------------------------------------------------------

    pub fn add_communicator(&self, communicator: Arc<dyn Communicator>) -> CandidateId {
        self.communicators.add(communicator)
    }

    pub fn remove_communicator(&self, id: CandidateId) -> bool {
        self.communicators.remove(id).is_some()
    }

    /// Attaches this process to `relay` as worker `worker_id`.
    ///
    /// Returns the id of the registered relay communicator.
    pub fn join_relay(&self, relay: &ClusterRelay, worker_id: WorkerId) -> CandidateId {
        let communicator = relay.join(worker_id, Arc::clone(&self.bus));
        self.communicators.add(communicator)
    }

    // -- dispatch -------------------------------------------------------------

    /// Executes `request` on the responsible manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::Arbitration`] when no manager is responsible,
    /// [`CoreError::Execution`] when the handler fails,
    /// [`CoreError::Timeout`] when the configured timeout elapses.
    pub async fn execute(
        &self,
        service_name: &str,
        request: Payload,
        ctx: CallContext,
    ) -> Result<Payload, CoreError> {
        self.dispatch(DispatchRequest::new(service_name, request, ctx)).await
    }

    /// Runs a fully specified request through the dispatch pipeline.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute).
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Payload, CoreError> {
        self.check_running()?;
        let pipeline = self.pipeline.lock().clone();
        pipeline.oneshot(request).await
    }

    /// Opens a response stream on the responsible manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::Arbitration`] when no manager is responsible.
    pub async fn stream(
        &self,
        service_name: &str,
        request: Payload,
        ctx: CallContext,
    ) -> Result<DispatchStream, CoreError> {
        self.check_running()?;
        self.dispatcher.stream(service_name, request, ctx).await
    }

    // -- events ---------------------------------------------------------------

    pub async fn emit(&self, event: &Payload, name: &str, ctx: &CallContext, broadcast: bool) {
        self.bus.emit(event, name, ctx, broadcast).await;
    }

    pub fn emit_detached(
        &self,
        event: Payload,
        name: impl Into<String>,
        ctx: CallContext,
        broadcast: bool,
    ) -> JoinHandle<()> {
        self.bus.emit_detached(event, name, ctx, broadcast)
    }

    /// Subscribes `handler` to `event_name`.
    ///
    /// # Errors
    ///
    /// See [`EventBus::subscribe`].
    pub async fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        target: SubscribeTarget,
        ctx: &CallContext,
    ) -> Result<EventSubscription, CoreError> {
        self.check_running()?;
        self.bus.subscribe(event_name, handler, target, ctx).await
    }

    pub async fn unsubscribe(&self, subscription: &EventSubscription, broadcast: bool) -> usize {
        self.bus.unsubscribe(subscription, broadcast).await
    }

    /// Accepts a subscription created in another process.
    ///
    /// # Errors
    ///
    /// See [`EventBus::receive_subscription`].
    pub async fn receive_subscription(
        &self,
        subscription: &EventSubscription,
        broadcast: bool,
    ) -> Result<usize, CoreError> {
        self.bus.receive_subscription(subscription, broadcast).await
    }

    // -- queue entries --------------------------------------------------------

    /// Persists an entry and schedules it.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::enqueue`].
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<QueueEntry, CoreError> {
        self.queues.enqueue(entry).await
    }

    /// # Errors
    ///
    /// [`CoreError::Persistence`] when a store fails to list.
    pub async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<QueueEntry>, CoreError> {
        self.queues.get_entries(filter).await
    }

    /// # Errors
    ///
    /// [`CoreError::Persistence`] when a store fails to delete.
    pub async fn remove_entries(&self, filter: &EntryFilter) -> Result<usize, CoreError> {
        self.queues.remove_entries(filter).await
    }

    /// # Errors
    ///
    /// [`CoreError::Persistence`] when a store fails to update.
    pub async fn cancel(&self, filter: &EntryFilter) -> Result<usize, CoreError> {
        self.queues.cancel(filter).await
    }

    pub fn request_sweep(&self) {
        self.queues.request_sweep(SweepTask::All);
    }

    // -- shutdown -------------------------------------------------------------

    /// Drains the queues, then terminates managers in reverse registration
    /// order and releases every communicator. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.config.node_id, "switchboard shutting down");

        self.queues.shutdown().await;

        let managers = self.managers.clear();
        for registered in managers.iter().rev() {
            terminate(registered.candidate.as_ref()).await;
        }
        let communicators = self.communicators.clear();

        info!(
            managers = managers.len(),
            communicators = communicators.len(),
            "switchboard stopped"
        );
    }
}

async fn terminate(manager: &dyn Manager) {
    if let Err(err) = manager.terminate().await {
        warn!(manager = manager.name(), error = %err, "manager terminate failed");
    }
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
