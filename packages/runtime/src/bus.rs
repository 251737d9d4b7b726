//! Event bus: local fan-out, subscription routing and cross-process relay.
//!
//! Every operation taking a `broadcast` flag forwards to the registered
//! communicators only when it is set. Messages arriving from a peer are
//! replayed with `broadcast = false`, which keeps relays from looping.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use switchboard_core::{CallContext, CandidateId, EventSubscription, Payload};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::communicator::Communicator;
use crate::error::CoreError;
use crate::manager::{EventHandler, Manager};
use crate::registry::{CandidateRegistry, Registered};
use crate::resolver;

/// How the owning manager of a new subscription is chosen.
#[derive(Debug, Clone)]
pub enum SubscribeTarget {
    /// Use this manager.
    Manager(CandidateId),
    /// Score every manager against the event name and this auxiliary data.
    Data(Option<Payload>),
}

pub struct EventBus {
    node_id: String,
    managers: Arc<CandidateRegistry<dyn Manager>>,
    communicators: Arc<CandidateRegistry<dyn Communicator>>,
    next_subscription_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        managers: Arc<CandidateRegistry<dyn Manager>>,
        communicators: Arc<CandidateRegistry<dyn Communicator>>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            managers,
            communicators,
            next_subscription_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Delivers an event to every local manager, then optionally relays it.
    ///
    /// A failing manager is logged and does not affect the others.
    pub async fn emit(&self, event: &Payload, name: &str, ctx: &CallContext, broadcast: bool) {
        let managers = self.managers.snapshot();
        let results = join_all(
            managers
                .iter()
                .map(|registered| registered.candidate.emit(event, name, ctx)),
        )
        .await;

        for (result, registered) in results.into_iter().zip(managers.iter()) {
            if let Err(err) = result {
                warn!(
                    event = name,
                    manager = registered.candidate.name(),
                    error = %err,
                    "local emit failed"
                );
            }
        }

        if broadcast {
            self.broadcast("event", |communicator| async move {
                communicator.broadcast_event(event, name, ctx).await
            })
            .await;
        }
    }

    /// Fire-and-forget form of [`emit`](Self::emit).
    pub fn emit_detached(
        self: &Arc<Self>,
        event: Payload,
        name: impl Into<String>,
        ctx: CallContext,
        broadcast: bool,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let name = name.into();
        tokio::spawn(async move { bus.emit(&event, &name, &ctx, broadcast).await })
    }

    /// Creates a subscription on the owning manager and announces it.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCandidate`] for an explicit owner that is not
    /// registered, [`CoreError::Arbitration`] when no manager claims the
    /// event, [`CoreError::Execution`] when the manager refuses.
    pub async fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        target: SubscribeTarget,
        ctx: &CallContext,
    ) -> Result<EventSubscription, CoreError> {
        let (owner, additional_data) = match target {
            SubscribeTarget::Manager(id) => {
                let candidate = self
                    .managers
                    .get(id)
                    .ok_or(CoreError::UnknownCandidate(id))?;
                (Registered { id, candidate }, None)
            }
            SubscribeTarget::Data(data) => {
                let snapshot = self.managers.snapshot();
                let data_ref = data.as_ref();
                let owner = resolver::resolve(&snapshot, |manager| async move {
                    manager.is_responsible_for_event(event_name, data_ref).await
                })
                .await?;
                (owner, data)
            }
        };

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let mut subscription = EventSubscription::new(id, self.node_id.clone(), event_name);
        subscription.client_id.clone_from(&ctx.client_id);
        subscription.context = ctx.clone();
        subscription.additional_data = additional_data;

        let stored = owner
            .candidate
            .subscribe(subscription, handler)
            .await
            .map_err(CoreError::Execution)?
            .with_owner(owner.id);

        debug!(
            subscription = stored.id,
            event = event_name,
            manager = owner.candidate.name(),
            "subscribed"
        );

        self.broadcast("subscribe", |communicator| {
            let stored = &stored;
            async move { communicator.broadcast_subscription(stored).await }
        })
        .await;

        Ok(stored)
    }

    /// Removes a subscription and optionally announces the removal.
    ///
    /// Routes to the owning manager when known; otherwise (or when the owner
    /// has since been removed) every manager claiming the event is asked.
    /// Returns how many managers dropped it.
    pub async fn unsubscribe(&self, subscription: &EventSubscription, broadcast: bool) -> usize {
        let owner = subscription
            .owner
            .and_then(|id| self.managers.get(id).map(|candidate| Registered { id, candidate }));

        let targets = if let Some(owner) = owner {
            vec![owner]
        } else {
            if let Some(id) = subscription.owner {
                debug!(owner = %id, "owning manager gone, probing");
            }
            let snapshot = self.managers.snapshot();
            resolver::responsible(&snapshot, |manager| async move {
                manager
                    .is_responsible_for_event(
                        &subscription.event_name,
                        subscription.additional_data.as_ref(),
                    )
                    .await
            })
            .await
        };

        let mut removed = 0;
        for target in &targets {
            match target.candidate.unsubscribe(subscription).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    subscription = subscription.id,
                    manager = target.candidate.name(),
                    error = %err,
                    "unsubscribe failed"
                ),
            }
        }

        if broadcast {
            self.broadcast("unsubscribe", |communicator| async move {
                communicator.broadcast_unsubscription(subscription).await
            })
            .await;
        }
        removed
    }

    /// Accepts a subscription created in another process.
    ///
    /// Each responsible manager's acceptance hook runs in registration
    /// order. Returns how many managers accepted it.
    ///
    /// # Errors
    ///
    /// The first rejection aborts with its error, typically
    /// [`CoreError::Authorization`].
    pub async fn receive_subscription(
        &self,
        subscription: &EventSubscription,
        broadcast: bool,
    ) -> Result<usize, CoreError> {
        let snapshot = self.managers.snapshot();
        let responsible = resolver::responsible(&snapshot, |manager| async move {
            manager
                .is_responsible_for_event(
                    &subscription.event_name,
                    subscription.additional_data.as_ref(),
                )
                .await
        })
        .await;

        for target in &responsible {
            if let Err(err) = target.candidate.receive_subscription(subscription).await {
                warn!(
                    subscription = subscription.id,
                    origin = %subscription.origin,
                    manager = target.candidate.name(),
                    error = %err,
                    "remote subscription rejected"
                );
                return Err(err);
            }
        }

        if broadcast {
            self.broadcast("subscribe", |communicator| async move {
                communicator.broadcast_subscription(subscription).await
            })
            .await;
        }
        Ok(responsible.len())
    }

    async fn broadcast<F, Fut>(&self, kind: &'static str, send: F)
    where
        F: Fn(Arc<dyn Communicator>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let communicators = self.communicators.snapshot();
        let results = join_all(
            communicators
                .iter()
                .map(|registered| send(Arc::clone(&registered.candidate))),
        )
        .await;

        for (result, registered) in results.into_iter().zip(communicators.iter()) {
            if let Err(err) = result {
                warn!(kind, communicator = %registered.id, error = %err, "broadcast failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
