//! Per-queue drain control with in-flight execution tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for in-flight tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Lifecycle of a queue as seen by the engine.
///
/// State machine: Accepting -> Draining -> Drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// New claims are allowed.
    Accepting,
    /// No new claims; waiting for in-flight executions.
    Draining,
    /// Every in-flight execution finished.
    Drained,
}

/// Gate in front of a queue's claims.
///
/// Every attempt acquires an [`InFlightGuard`] before claiming an entry.
/// Once [`trigger_drain`](Self::trigger_drain) is called, acquisition fails
/// and [`wait_for_drain`](Self::wait_for_drain) waits for outstanding
/// guards. Running executions are never cancelled.
#[derive(Debug)]
pub struct DrainController {
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<DrainState>,
}

impl DrainController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(DrainState::Accepting),
        }
    }

    #[must_use]
    pub fn state(&self) -> DrainState {
        **self.state.load()
    }

    /// Registers an in-flight execution, unless the queue is draining.
    #[must_use]
    pub fn try_acquire(&self) -> Option<InFlightGuard> {
        if self.state() != DrainState::Accepting {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        // A drain triggered between the check and the increment must not
        // miss this execution; back out instead.
        if self.state() != DrainState::Accepting {
            return None;
        }
        Some(guard)
    }

    /// Stops accepting new claims.
    pub fn trigger_drain(&self) {
        if self.state() == DrainState::Accepting {
            self.state.store(Arc::new(DrainState::Draining));
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits for all in-flight executions, up to `timeout`.
    ///
    /// Returns `true` (and moves to `Drained`) once none remain, `false` if
    /// the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                self.state.store(Arc::new(DrainState::Drained));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_accepting() {
        let controller = DrainController::new();
        assert_eq!(controller.state(), DrainState::Accepting);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn guards_track_in_flight() {
        let controller = DrainController::new();
        let first = controller.try_acquire().unwrap();
        let second = controller.try_acquire().unwrap();
        assert_eq!(controller.in_flight_count(), 2);
        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn draining_refuses_new_claims() {
        let controller = DrainController::new();
        controller.trigger_drain();
        assert_eq!(controller.state(), DrainState::Draining);
        assert!(controller.try_acquire().is_none());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_completes_immediately_when_idle() {
        let controller = DrainController::new();
        controller.trigger_drain();
        assert!(controller.wait_for_drain(Duration::from_millis(100)).await);
        assert_eq!(controller.state(), DrainState::Drained);
    }

    #[tokio::test]
    async fn drain_times_out_with_outstanding_guard() {
        let controller = DrainController::new();
        let _guard = controller.try_acquire().unwrap();
        controller.trigger_drain();
        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.state(), DrainState::Draining);
    }

    #[tokio::test]
    async fn drain_waits_for_guard_release() {
        let controller = Arc::new(DrainController::new());
        let guard = controller.try_acquire().unwrap();
        controller.trigger_drain();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(5)).await);
        releaser.await.unwrap();
    }
}
