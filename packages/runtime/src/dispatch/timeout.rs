//! Timeout middleware for dispatched executions.
//!
//! Each request may carry its own timeout; otherwise the layer default
//! applies. With neither set the execution runs unbounded.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use switchboard_core::Payload;
use tower::{Layer, Service};

use super::DispatchRequest;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing per-request execution timeouts.
#[derive(Debug, Clone, Default)]
pub struct TimeoutLayer {
    default: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default: Option<Duration>) -> Self {
        Self { default }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default: self.default,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default: Option<Duration>,
}

impl<S> Service<DispatchRequest> for TimeoutService<S>
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
        let limit = req.timeout.or(self.default);
        let fut = self.inner.call(req);
        Box::pin(async move {
            let Some(limit) = limit else {
                return fut.await;
            };
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = limit.as_millis() as u64;
                    Err(CoreError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchboard_core::CallContext;
    use tower::ServiceExt;

    use super::*;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<DispatchRequest> for SlowService {
        type Response = Payload;
        type Error = CoreError;
        type Future = Pin<Box<dyn Future<Output = Result<Payload, CoreError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: DispatchRequest) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(json!("done"))
            })
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest::new("slow", json!(null), CallContext::default())
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_default() {
        let svc = TimeoutLayer::new(Some(Duration::from_millis(100))).layer(SlowService { delay_ms: 10 });
        assert_eq!(svc.oneshot(request()).await.unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_expires() {
        let svc = TimeoutLayer::new(Some(Duration::from_millis(50))).layer(SlowService { delay_ms: 500 });
        let err = svc.oneshot(request()).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_overrides_default() {
        let svc = TimeoutLayer::new(Some(Duration::from_secs(60))).layer(SlowService { delay_ms: 500 });
        let err = svc
            .oneshot(request().with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { timeout_ms: 20 }));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_runs_unbounded() {
        let svc = TimeoutLayer::default().layer(SlowService { delay_ms: 5_000 });
        assert_eq!(svc.oneshot(request()).await.unwrap(), json!("done"));
    }
}
