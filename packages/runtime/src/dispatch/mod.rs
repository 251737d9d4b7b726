//! Request dispatch: resolves the responsible manager and executes on it.
//!
//! The [`Dispatcher`] is a `tower::Service` so that cross-cutting concerns
//! (timing, timeouts) compose as layers around it; see [`pipeline`].

pub mod metrics;
pub mod pipeline;
pub mod timeout;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use switchboard_core::{CallContext, Payload};
use tower::Service;
use tracing::debug;

use crate::error::CoreError;
use crate::manager::Manager;
use crate::registry::{CandidateRegistry, Registered};
use crate::resolver;

pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};

/// A single execution routed through the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub service_name: String,
    pub request: Payload,
    pub context: CallContext,
    /// Overrides the pipeline's default execution timeout.
    pub timeout: Option<Duration>,
}

impl DispatchRequest {
    #[must_use]
    pub fn new(service_name: impl Into<String>, request: Payload, context: CallContext) -> Self {
        Self {
            service_name: service_name.into(),
            request,
            context,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Streamed responses with errors already mapped into the core taxonomy.
pub type DispatchStream = BoxStream<'static, Result<Payload, CoreError>>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes executions to the highest-scoring registered manager.
#[derive(Clone)]
pub struct Dispatcher {
    managers: Arc<CandidateRegistry<dyn Manager>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(managers: Arc<CandidateRegistry<dyn Manager>>) -> Self {
        Self { managers }
    }

    /// Picks the manager responsible for `request` on `service_name`.
    ///
    /// # Errors
    ///
    /// [`CoreError::Arbitration`] when no manager claims the request.
    pub async fn resolve(
        &self,
        request: &Payload,
        service_name: &str,
    ) -> Result<Registered<dyn Manager>, CoreError> {
        let snapshot = self.managers.snapshot();
        let winner = resolver::resolve(&snapshot, |manager| async move {
            manager.is_responsible(request, service_name).await
        })
        .await?;
        debug!(
            service = service_name,
            manager = winner.candidate.name(),
            "request routed"
        );
        Ok(winner)
    }

    /// Executes `request` on the responsible manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::Arbitration`] when no manager is responsible,
    /// [`CoreError::Execution`] when the handler fails.
    pub async fn execute(
        &self,
        service_name: &str,
        request: Payload,
        ctx: CallContext,
    ) -> Result<Payload, CoreError> {
        let winner = self.resolve(&request, service_name).await?;
        winner
            .candidate
            .execute(service_name, request, ctx)
            .await
            .map_err(CoreError::Execution)
    }

    /// Opens a response stream on the responsible manager.
    ///
    /// Arbitration happens eagerly; items are produced lazily.
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
        let winner = self.resolve(&request, service_name).await?;
        Ok(winner
            .candidate
            .stream(service_name, request, ctx)
            .map(|item| item.map_err(CoreError::Execution))
            .boxed())
    }
}

impl Service<DispatchRequest> for Dispatcher {
    type Response = Payload;
    type Error = CoreError;
    type Future = Pin<Box<dyn Future<Output = Result<Payload, CoreError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            this.execute(&req.service_name, req.request, req.context)
                .await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
