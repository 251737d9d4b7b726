//! Cluster relay: a coordinator fanning relay messages out between workers.
//!
//! Each worker owns one bounded outbound channel into the coordinator and
//! one bounded inbound channel out of it. The coordinator forwards every
//! envelope to every worker except the one named as its origin. Workers
//! replay inbound messages on their local bus with `broadcast = false`, so a
//! message crosses the relay at most once.
//!
//! Event handlers on a worker may themselves emit with `broadcast = true`.
//! Each worker therefore drains its bounded inbound channel into an
//! unbounded replay queue, and a separate task replays that queue in order.
//! A handler blocked on a full relay never stops its own worker from
//! accepting messages, so the coordinator cannot wedge on it. The replay
//! queue grows while handlers are slower than the inbound rate.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use switchboard_core::{CallContext, EventSubscription, Payload, RelayEnvelope, RelayMessage, WorkerId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::communicator::{event_message, subscribe_message, unsubscribe_message, Communicator};

type WorkerChannels = Arc<DashMap<WorkerId, mpsc::Sender<RelayMessage>>>;

// ---------------------------------------------------------------------------
// ClusterRelay
// ---------------------------------------------------------------------------

pub struct ClusterRelay {
    workers: WorkerChannels,
    inbound_tx: mpsc::Sender<RelayEnvelope>,
    capacity: usize,
    shutdown_tx: watch::Sender<bool>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterRelay {
    /// Spawns the coordinator loop. `capacity` bounds every channel.
    #[must_use]
    pub fn start(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers: WorkerChannels = Arc::new(DashMap::new());

        let coordinator = tokio::spawn(coordinate(Arc::clone(&workers), inbound_rx, shutdown_rx));
        info!(capacity, "cluster relay started");

        Arc::new(Self {
            workers,
            inbound_tx,
            capacity,
            shutdown_tx,
            coordinator: Mutex::new(Some(coordinator)),
        })
    }

    /// Attaches a worker whose inbound messages are replayed on `bus`.
    ///
    /// Returns the communicator the worker registers to publish through the
    /// relay. Re-joining with an existing id replaces the previous channel.
    pub fn join(&self, worker_id: WorkerId, bus: Arc<EventBus>) -> Arc<WorkerCommunicator> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.workers.insert(worker_id.clone(), tx).is_some() {
            debug!(worker = %worker_id, "worker re-joined, previous channel replaced");
        }
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(worker_id.clone(), rx, replay_tx));
        tokio::spawn(replay(worker_id.clone(), replay_rx, bus));
        info!(worker = %worker_id, workers = self.workers.len(), "worker joined relay");

        Arc::new(WorkerCommunicator {
            worker_id,
            outbound: self.inbound_tx.clone(),
        })
    }

    /// Detaches a worker. Its inbound pump ends once its channel drains.
    pub fn detach_worker(&self, worker_id: &WorkerId) -> bool {
        let removed = self.workers.remove(worker_id).is_some();
        if removed {
            info!(worker = %worker_id, "worker detached from relay");
        }
        removed
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops the coordinator and detaches every worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let coordinator = self.coordinator.lock().take();
        if let Some(handle) = coordinator {
            let _ = handle.await;
        }
        self.workers.clear();
        info!("cluster relay stopped");
    }
}

async fn coordinate(
    workers: WorkerChannels,
    mut inbound_rx: mpsc::Receiver<RelayEnvelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            envelope = inbound_rx.recv() => {
                match envelope {
                    Some(envelope) => fan_out(&workers, envelope).await,
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Forwards `envelope` to every worker except its origin.
async fn fan_out(workers: &WorkerChannels, envelope: RelayEnvelope) {
    let kind = envelope.message.kind();
    let targets: Vec<(WorkerId, mpsc::Sender<RelayMessage>)> = workers
        .iter()
        .filter(|w| w.key() != &envelope.origin)
        .map(|w| (w.key().clone(), w.value().clone()))
        .collect();

    for (worker_id, tx) in targets {
        if tx.send(envelope.message.clone()).await.is_err() {
            warn!(worker = %worker_id, "worker channel closed, detaching");
            workers.remove_if(&worker_id, |_, current| current.same_channel(&tx));
            continue;
        }
        metrics::counter!("switchboard_relay_messages_total", "kind" => kind).increment(1);
    }
}

/// Moves relayed messages off the bounded channel without waiting on handlers.
async fn pump(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<RelayMessage>,
    replay_tx: mpsc::UnboundedSender<RelayMessage>,
) {
    while let Some(message) = rx.recv().await {
        debug!(worker = %worker_id, kind = message.kind(), "relayed message received");
        if replay_tx.send(message).is_err() {
            break;
        }
    }
    debug!(worker = %worker_id, "relay pump stopped");
}

/// Replays relayed messages on the worker's local bus, in arrival order.
async fn replay(worker_id: WorkerId, mut rx: mpsc::UnboundedReceiver<RelayMessage>, bus: Arc<EventBus>) {
    while let Some(message) = rx.recv().await {
        match message {
            RelayMessage::Event(payload) => {
                bus.emit(&payload.event, &payload.name, &payload.context, false)
                    .await;
            }
            RelayMessage::Subscribe(payload) => {
                if let Err(err) = bus.receive_subscription(&payload.subscription, false).await {
                    warn!(
                        worker = %worker_id,
                        subscription = payload.subscription.id,
                        error = %err,
                        "relayed subscription rejected"
                    );
                }
            }
            RelayMessage::Unsubscribe(payload) => {
                bus.unsubscribe(&payload.subscription, false).await;
            }
        }
    }
    debug!(worker = %worker_id, "relay replay stopped");
}

// ---------------------------------------------------------------------------
// WorkerCommunicator
// ---------------------------------------------------------------------------

/// A worker's handle for publishing into the relay.
#[derive(Debug, Clone)]
pub struct WorkerCommunicator {
    worker_id: WorkerId,
    outbound: mpsc::Sender<RelayEnvelope>,
}

impl WorkerCommunicator {
    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    async fn publish(&self, message: RelayMessage) -> anyhow::Result<()> {
        self.outbound
            .send(RelayEnvelope::new(self.worker_id.clone(), message))
            .await
            .map_err(|_| anyhow::anyhow!("cluster relay is not running"))
    }
}

#[async_trait]
impl Communicator for WorkerCommunicator {
    async fn broadcast_event(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()> {
        self.publish(event_message(event, name, ctx)).await
    }

    async fn broadcast_subscription(&self, subscription: &EventSubscription) -> anyhow::Result<()> {
        self.publish(subscribe_message(subscription)).await
    }

    async fn broadcast_unsubscription(&self, subscription: &EventSubscription) -> anyhow::Result<()> {
        self.publish(unsubscribe_message(subscription)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use switchboard_core::EventPayload;

    use super::*;
    use crate::bus::SubscribeTarget;
    use crate::manager::{EventHandler, Manager};
    use crate::memory::LocalManager;
    use crate::registry::CandidateRegistry;

    struct Worker {
        bus: Arc<EventBus>,
        manager: Arc<LocalManager>,
    }

    fn worker(relay: &ClusterRelay, id: &str) -> Worker {
        let manager = Arc::new(LocalManager::new(id));
        let managers: Arc<CandidateRegistry<dyn Manager>> = Arc::new(CandidateRegistry::new());
        managers.add(Arc::clone(&manager) as Arc<dyn Manager>);
        let communicators: Arc<CandidateRegistry<dyn Communicator>> = Arc::new(CandidateRegistry::new());
        let bus = Arc::new(EventBus::new(id, managers, Arc::clone(&communicators)));
        communicators.add(relay.join(WorkerId::new(id), Arc::clone(&bus)));
        Worker { bus, manager }
    }

    async fn listen(w: &Worker, event: &str) -> mpsc::UnboundedReceiver<EventPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        w.bus
            .subscribe(event, Arc::new(tx), SubscribeTarget::Data(None), &CallContext::default())
            .await
            .unwrap();
        rx
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn events_reach_every_other_worker_without_echo() {
        let relay = ClusterRelay::start(16);
        let w1 = worker(&relay, "w1");
        let w2 = worker(&relay, "w2");
        let w3 = worker(&relay, "w3");

        let mut rx1 = listen(&w1, "tick").await;
        let mut rx2 = listen(&w2, "tick").await;
        let mut rx3 = listen(&w3, "tick").await;
        settle().await;

        w1.bus
            .emit(&json!({"n": 1}), "tick", &CallContext::for_node("w1"), true)
            .await;
        settle().await;

        assert_eq!(rx2.recv().await.unwrap().event, json!({"n": 1}));
        assert_eq!(rx3.recv().await.unwrap().event, json!({"n": 1}));

        // Delivered locally exactly once; nothing came back through the relay.
        assert!(rx1.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn subscriptions_and_unsubscriptions_are_relayed() {
        let relay = ClusterRelay::start(16);
        let w1 = worker(&relay, "w1");
        let w2 = worker(&relay, "w2");

        let (tx, _rx) = mpsc::unbounded_channel::<EventPayload>();
        let sub = w1
            .bus
            .subscribe("tick", Arc::new(tx), SubscribeTarget::Data(None), &CallContext::default())
            .await
            .unwrap();
        settle().await;

        let remote = w2.manager.remote_subscriptions();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].origin, "w1");
        assert!(w1.manager.remote_subscriptions().is_empty());

        w1.bus.unsubscribe(&sub, true).await;
        settle().await;
        assert!(w2.manager.remote_subscriptions().is_empty());

        relay.shutdown().await;
    }

    /// Answers every event by emitting `reply` across the relay.
    struct Responder {
        bus: Arc<EventBus>,
        reply: &'static str,
    }

    #[async_trait]
    impl EventHandler for Responder {
        async fn handle(&self, event: &Payload, _: &str, ctx: &CallContext) -> anyhow::Result<()> {
            self.bus.emit(event, self.reply, ctx, true).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_that_rebroadcast_do_not_stall_a_small_relay() {
        let relay = ClusterRelay::start(1);
        let w1 = worker(&relay, "w1");
        let w2 = worker(&relay, "w2");

        let responder = Arc::new(Responder {
            bus: Arc::clone(&w2.bus),
            reply: "pong",
        });
        w2.bus
            .subscribe("ping", responder, SubscribeTarget::Data(None), &CallContext::default())
            .await
            .unwrap();
        let mut pongs = listen(&w1, "pong").await;
        settle().await;

        for n in 0..16 {
            w1.bus.emit(&json!(n), "ping", &CallContext::for_node("w1"), true).await;
        }

        let received = tokio::time::timeout(Duration::from_secs(2), async {
            let mut seen = Vec::new();
            while seen.len() < 16 {
                seen.push(pongs.recv().await.unwrap().event);
            }
            seen
        })
        .await
        .expect("relay stalled");
        assert_eq!(received, (0..16).map(|n| json!(n)).collect::<Vec<_>>());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn detached_worker_stops_receiving() {
        let relay = ClusterRelay::start(16);
        let w1 = worker(&relay, "w1");
        let w2 = worker(&relay, "w2");
        let mut rx2 = listen(&w2, "tick").await;
        settle().await;

        assert!(relay.detach_worker(&WorkerId::new("w2")));
        assert_eq!(relay.worker_count(), 1);

        w1.bus.emit(&json!(1), "tick", &CallContext::default(), true).await;
        settle().await;
        assert!(rx2.try_recv().is_err());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn publishing_after_shutdown_fails() {
        let relay = ClusterRelay::start(4);
        let managers: Arc<CandidateRegistry<dyn Manager>> = Arc::new(CandidateRegistry::new());
        let bus = Arc::new(EventBus::new("w1", managers, Arc::new(CandidateRegistry::new())));
        let communicator = relay.join(WorkerId::new("w1"), bus);

        relay.shutdown().await;
        assert_eq!(relay.worker_count(), 0);
        assert!(communicator
            .broadcast_event(&json!(1), "tick", &CallContext::default())
            .await
            .is_err());
    }
}
