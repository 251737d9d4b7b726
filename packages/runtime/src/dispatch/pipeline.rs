//! Pipeline composition: wraps the dispatcher with its middleware stack.

use std::time::Duration;

use switchboard_core::Payload;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use super::{DispatchRequest, Dispatcher};
use crate::error::CoreError;

/// Type-erased, cloneable dispatch pipeline.
pub type DispatchPipeline = BoxCloneService<DispatchRequest, Payload, CoreError>;

/// Builds the dispatch pipeline around `dispatcher`.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- timing and outcome, including timeouts
/// 2. `TimeoutLayer` -- per-request or default execution cap
#[must_use]
pub fn build_dispatch_pipeline(
    dispatcher: Dispatcher,
    default_timeout: Option<Duration>,
) -> DispatchPipeline {
    let svc = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer::new(default_timeout))
        .service(dispatcher);
    BoxCloneService::new(svc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
