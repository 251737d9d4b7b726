//! The manager contract: a candidate backend that executes requests and
//! hosts event subscriptions.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use switchboard_core::{CallContext, CandidateId, EventPayload, EventSubscription, Payload};
use tokio::sync::mpsc;

use crate::config::CoreConfig;
use crate::error::CoreError;

/// Lazily produced sequence of responses.
pub type ResponseStream = BoxStream<'static, anyhow::Result<Payload>>;

// ---------------------------------------------------------------------------
// LifecycleContext
// ---------------------------------------------------------------------------

/// Context handed to candidates when they are added to a registry.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    pub config: Arc<CoreConfig>,
    /// Id the candidate was registered under.
    pub id: CandidateId,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// A backend competing to handle requests and events.
///
/// Managers are registered with the facade, initialized when added and
/// terminated when removed or on shutdown. Every responsibility query
/// returns an affinity score: `0` means "not mine", higher beats lower.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Called once when the manager is registered.
    async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the manager is removed or the process shuts down.
    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Affinity for executing `request` against `service_name`.
    async fn is_responsible(&self, request: &Payload, service_name: &str) -> anyhow::Result<u32>;

    /// Executes a single request.
    async fn execute(
        &self,
        service_name: &str,
        request: Payload,
        ctx: CallContext,
    ) -> anyhow::Result<Payload>;

    /// Executes a request producing a lazy sequence of responses.
    fn stream(&self, service_name: &str, request: Payload, ctx: CallContext) -> ResponseStream;

    /// Affinity for hosting subscriptions to `event_name`.
    async fn is_responsible_for_event(
        &self,
        event_name: &str,
        additional_data: Option<&Payload>,
    ) -> anyhow::Result<u32>;

    /// Delivers an event to this manager's local subscribers.
    async fn emit(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()>;

    /// Registers `handler` for the subscription and returns the stored form.
    async fn subscribe(
        &self,
        subscription: EventSubscription,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<EventSubscription>;

    /// Removes a subscription. Returns `false` if it was not known here.
    async fn unsubscribe(&self, subscription: &EventSubscription) -> anyhow::Result<bool>;

    /// Acceptance hook for a subscription created in another process.
    ///
    /// Return [`CoreError::Authorization`] to reject it.
    async fn receive_subscription(&self, subscription: &EventSubscription) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// Receiver of events delivered to a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()>;
}

/// Forwards every delivered event into a channel.
#[async_trait]
impl EventHandler for mpsc::UnboundedSender<EventPayload> {
    async fn handle(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()> {
        self.send(EventPayload {
            name: name.to_string(),
            event: event.clone(),
            context: ctx.clone(),
        })
        .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

// ---------------------------------------------------------------------------
// ServiceHandler
// ---------------------------------------------------------------------------

/// Implementation of one named service hosted by a manager.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn call(&self, request: Payload, ctx: CallContext) -> anyhow::Result<Payload>;

    /// Streaming form. Defaults to a single-item stream of [`call`](Self::call).
    fn stream(self: Arc<Self>, request: Payload, ctx: CallContext) -> ResponseStream {
        Box::pin(futures_util::stream::once(async move {
            self.call(request, ctx).await
        }))
    }
}

/// Adapter turning an async closure into a [`ServiceHandler`].
pub struct ServiceFn<F>(F);

/// Wraps `f` as a [`ServiceHandler`].
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Payload, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    ServiceFn(f)
}

#[async_trait]
impl<F, Fut> ServiceHandler for ServiceFn<F>
where
    F: Fn(Payload, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn call(&self, request: Payload, ctx: CallContext) -> anyhow::Result<Payload> {
        (self.0)(request, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
