//! Metrics middleware for dispatched executions.
//!
//! Wraps every execution in an `info` span carrying its duration and outcome
//! and bumps the `switchboard_dispatch_total` counter.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use switchboard_core::Payload;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::DispatchRequest;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments executions with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records execution duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<DispatchRequest> for MetricsService<S>
where
    S: Service<DispatchRequest, Response = Payload, Error = CoreError> + Send,
    S::Future: Send + 'static,
{
    type Response = Payload;
    type Error = CoreError;
    type Future = Pin<Box<dyn Future<Output = Result<Payload, CoreError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let service_name = req.service_name.clone();

        let span = info_span!(
            "dispatch",
            service = %service_name,
            trace_id = %req.context.trace_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "switchboard_dispatch_total",
                    "service" => service_name.clone(),
                    "outcome" => outcome,
                )
                .increment(1);

                tracing::debug!(
                    service = %service_name,
                    duration_ms,
                    outcome,
                    "dispatch complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
