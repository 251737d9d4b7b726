//! In-process [`Manager`] backed by [`DashMap`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use switchboard_core::{CallContext, EventSubscription, Payload};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::manager::{EventHandler, LifecycleContext, Manager, ResponseStream, ServiceHandler};

type RequestAffinity = Box<dyn Fn(&Payload, &str) -> u32 + Send + Sync>;
type EventAffinity = Box<dyn Fn(&str, Option<&Payload>) -> u32 + Send + Sync>;
type AcceptancePolicy = Box<dyn Fn(&EventSubscription) -> Result<(), CoreError> + Send + Sync>;

struct LocalHandler {
    key: (String, u64),
    handler: Arc<dyn EventHandler>,
}

/// Manager hosting services and subscriptions inside the current process.
///
/// By default it claims every service it hosts with affinity `1`, every
/// event with affinity `1`, and accepts every remote subscription. Each of
/// these can be replaced with a closure.
pub struct LocalManager {
    name: String,
    services: DashMap<String, Arc<dyn ServiceHandler>>,
    /// Event name -> handlers registered locally for it.
    handlers: DashMap<String, Vec<LocalHandler>>,
    /// (origin, id) -> event name, for local subscriptions.
    subscriptions: DashMap<(String, u64), String>,
    /// Subscriptions accepted from other processes.
    remote: DashMap<(String, u64), EventSubscription>,
    affinity: u32,
    event_affinity: u32,
    request_affinity_fn: Option<RequestAffinity>,
    event_affinity_fn: Option<EventAffinity>,
    acceptance: Option<AcceptancePolicy>,
    initialized: AtomicBool,
    terminated: AtomicBool,
}

impl LocalManager {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: DashMap::new(),
            handlers: DashMap::new(),
            subscriptions: DashMap::new(),
            remote: DashMap::new(),
            affinity: 1,
            event_affinity: 1,
            request_affinity_fn: None,
            event_affinity_fn: None,
            acceptance: None,
            initialized: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Score returned for requests to a hosted service.
    #[must_use]
    pub fn with_affinity(mut self, affinity: u32) -> Self {
        self.affinity = affinity;
        self
    }

    /// Score returned for every event name.
    #[must_use]
    pub fn with_event_affinity(mut self, affinity: u32) -> Self {
        self.event_affinity = affinity;
        self
    }

    /// Replaces the request scoring rule.
    #[must_use]
    pub fn with_request_affinity_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Payload, &str) -> u32 + Send + Sync + 'static,
    {
        self.request_affinity_fn = Some(Box::new(f));
        self
    }

    /// Replaces the event scoring rule.
    #[must_use]
    pub fn with_event_affinity_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&Payload>) -> u32 + Send + Sync + 'static,
    {
        self.event_affinity_fn = Some(Box::new(f));
        self
    }

    /// Installs an acceptance policy for subscriptions from other processes.
    #[must_use]
    pub fn with_acceptance<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventSubscription) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.acceptance = Some(Box::new(f));
        self
    }

    /// Hosts `handler` under `service_name`, replacing any previous one.
    pub fn register_service<H: ServiceHandler>(&self, service_name: impl Into<String>, handler: H) {
        self.services.insert(service_name.into(), Arc::new(handler));
    }

    pub fn unregister_service(&self, service_name: &str) -> bool {
        self.services.remove(service_name).is_some()
    }

    /// Number of local handlers registered for `event_name`.
    #[must_use]
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.get(event_name).map_or(0, |h| h.len())
    }

    /// `true` while at least one local handler exists for `event_name`.
    #[must_use]
    pub fn tracks_event(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Subscriptions accepted from other processes.
    #[must_use]
    pub fn remote_subscriptions(&self) -> Vec<EventSubscription> {
        self.remote.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn remove_handler(&self, event_name: &str, key: &(String, u64)) -> bool {
        let mut removed = false;
        let mut now_empty = false;
        if let Some(mut handlers) = self.handlers.get_mut(event_name) {
            let before = handlers.len();
            handlers.retain(|h| &h.key != key);
            removed = handlers.len() != before;
            now_empty = handlers.is_empty();
        }
        if now_empty {
            self.handlers.remove_if(event_name, |_, handlers| handlers.is_empty());
            debug!(manager = %self.name, event = event_name, "last handler removed");
        }
        removed
    }
}

#[async_trait]
impl Manager for LocalManager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &LifecycleContext) -> anyhow::Result<()> {
        self.initialized.store(true, Ordering::Release);
        info!(manager = %self.name, id = %ctx.id, services = self.services.len(), "manager initialized");
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.handlers.clear();
        self.subscriptions.clear();
        self.remote.clear();
        self.terminated.store(true, Ordering::Release);
        info!(manager = %self.name, "manager terminated");
        Ok(())
    }

    async fn is_responsible(&self, request: &Payload, service_name: &str) -> anyhow::Result<u32> {
        if let Some(f) = &self.request_affinity_fn {
            return Ok(f(request, service_name));
        }
        Ok(if self.services.contains_key(service_name) {
            self.affinity
        } else {
            0
        })
    }

    async fn execute(
        &self,
        service_name: &str,
        request: Payload,
        ctx: CallContext,
    ) -> anyhow::Result<Payload> {
        let handler = self
            .services
            .get(service_name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| anyhow::anyhow!("service `{service_name}` is not hosted by `{}`", self.name))?;
        handler.call(request, ctx).await
    }

    fn stream(&self, service_name: &str, request: Payload, ctx: CallContext) -> ResponseStream {
        match self.services.get(service_name).map(|h| Arc::clone(h.value())) {
            Some(handler) => handler.stream(request, ctx),
            None => {
                let message = format!("service `{service_name}` is not hosted by `{}`", self.name);
                futures_util::stream::once(async move { Err(anyhow::anyhow!(message)) }).boxed()
            }
        }
    }

    async fn is_responsible_for_event(
        &self,
        event_name: &str,
        additional_data: Option<&Payload>,
    ) -> anyhow::Result<u32> {
        Ok(match &self.event_affinity_fn {
            Some(f) => f(event_name, additional_data),
            None => self.event_affinity,
        })
    }

    async fn emit(&self, event: &Payload, name: &str, ctx: &CallContext) -> anyhow::Result<()> {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .get(name)
            .map(|h| h.iter().map(|entry| Arc::clone(&entry.handler)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if let Err(err) = handler.handle(event, name, ctx).await {
                warn!(manager = %self.name, event = name, error = %err, "event handler failed");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription: EventSubscription,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<EventSubscription> {
        let key = subscription.key();
        self.handlers
            .entry(subscription.event_name.clone())
            .or_default()
            .push(LocalHandler {
                key: key.clone(),
                handler,
            });
        self.subscriptions.insert(key, subscription.event_name.clone());
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: &EventSubscription) -> anyhow::Result<bool> {
        let key = subscription.key();
        if let Some((_, event_name)) = self.subscriptions.remove(&key) {
            return Ok(self.remove_handler(&event_name, &key));
        }
        Ok(self.remote.remove(&key).is_some())
    }

    async fn receive_subscription(&self, subscription: &EventSubscription) -> Result<(), CoreError> {
        if let Some(policy) = &self.acceptance {
            policy(subscription)?;
        }
        self.remote.insert(subscription.key(), subscription.clone());
        debug!(
            manager = %self.name,
            origin = %subscription.origin,
            event = %subscription.event_name,
            "remote subscription accepted"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
