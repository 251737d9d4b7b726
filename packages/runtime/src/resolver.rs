//! Responsibility arbitration among competing candidates.
//!
//! Every candidate is asked for an affinity score concurrently and all
//! answers are awaited before deciding: a later-registered candidate with a
//! higher score must still be able to outrank an earlier one. Score `0`
//! means "not responsible"; among the highest positive scores the earliest
//! registered candidate wins.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::ArbitrationError;
use crate::registry::Registered;

/// Queries every candidate's affinity concurrently.
///
/// Returns one score per candidate, in input order. A failed query is
/// logged and scores `0`.
pub async fn score_all<T, F, Fut>(candidates: &[Registered<T>], score: F) -> Vec<u32>
where
    T: ?Sized,
    F: Fn(Arc<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<u32>>,
{
    let results = join_all(candidates.iter().map(|r| score(Arc::clone(&r.candidate)))).await;

    results
        .into_iter()
        .zip(candidates)
        .map(|(result, registered)| match result {
            Ok(score) => score,
            Err(err) => {
                warn!(candidate = %registered.id, error = %err, "affinity query failed, scoring 0");
                0
            }
        })
        .collect()
}

/// Index of the winning score: the first maximum, if that maximum is positive.
#[must_use]
pub fn pick_winner(scores: &[u32]) -> Option<usize> {
    let max = *scores.iter().max()?;
    if max == 0 {
        return None;
    }
    scores.iter().position(|&s| s == max)
}

/// Picks the single candidate responsible for a request.
///
/// # Errors
///
/// [`ArbitrationError::NoCandidates`] when `candidates` is empty,
/// [`ArbitrationError::NoResponsibleCandidate`] when every score is `0`.
pub async fn resolve<T, F, Fut>(
    candidates: &[Registered<T>],
    score: F,
) -> Result<Registered<T>, ArbitrationError>
where
    T: ?Sized,
    F: Fn(Arc<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<u32>>,
{
    if candidates.is_empty() {
        return Err(ArbitrationError::NoCandidates);
    }
    let scores = score_all(candidates, score).await;
    let winner = pick_winner(&scores).ok_or(ArbitrationError::NoResponsibleCandidate)?;
    debug!(
        candidate = %candidates[winner].id,
        score = scores[winner],
        contenders = candidates.len(),
        "candidate resolved"
    );
    Ok(candidates[winner].clone())
}

/// Every candidate that claims any responsibility, in registration order.
pub async fn responsible<T, F, Fut>(candidates: &[Registered<T>], score: F) -> Vec<Registered<T>>
where
    T: ?Sized,
    F: Fn(Arc<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<u32>>,
{
    let scores = score_all(candidates, score).await;
    candidates
        .iter()
        .zip(scores)
        .filter(|(_, score)| *score > 0)
        .map(|(registered, _)| registered.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::registry::CandidateRegistry;

    struct Scored {
        label: &'static str,
        score: u32,
        delay_ms: u64,
        fail: bool,
        calls: AtomicU32,
    }

    impl Scored {
        fn new(label: &'static str, score: u32) -> Arc<Self> {
            Arc::new(Self {
                label,
                score,
                delay_ms: 0,
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn slow(label: &'static str, score: u32, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                label,
                score,
                delay_ms,
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                score: 100,
                delay_ms: 0,
                fail: true,
                calls: AtomicU32::new(0),
            })
        }

        async fn affinity(&self) -> anyhow::Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            Ok(self.score)
        }
    }

    fn registry_of(items: Vec<Arc<Scored>>) -> CandidateRegistry<Scored> {
        let registry = CandidateRegistry::new();
        for item in items {
            registry.add(item);
        }
        registry
    }

    async fn winner(registry: &CandidateRegistry<Scored>) -> Result<&'static str, ArbitrationError> {
        let snapshot = registry.snapshot();
        resolve(&snapshot, |c| async move { c.affinity().await })
            .await
            .map(|r| r.candidate.label)
    }

    #[test]
    fn pick_winner_rules() {
        assert_eq!(pick_winner(&[0, 0, 3, 1]), Some(2));
        assert_eq!(pick_winner(&[2, 5, 5]), Some(1));
        assert_eq!(pick_winner(&[0, 0]), None);
        assert_eq!(pick_winner(&[]), None);
    }

    #[tokio::test]
    async fn highest_score_wins_in_any_order() {
        let orders: [[u32; 4]; 4] = [[0, 0, 3, 1], [3, 0, 1, 0], [1, 3, 0, 0], [0, 1, 0, 3]];
        for order in orders {
            let labels = ["a", "b", "c", "d"];
            let items = order
                .iter()
                .zip(labels)
                .map(|(&score, label)| Scored::new(label, score))
                .collect();
            let registry = registry_of(items);
            let expected = labels[order.iter().position(|&s| s == 3).unwrap()];
            assert_eq!(winner(&registry).await, Ok(expected));
        }
    }

    #[tokio::test]
    async fn all_zero_is_an_error() {
        let registry = registry_of(vec![Scored::new("a", 0), Scored::new("b", 0)]);
        assert_eq!(
            winner(&registry).await,
            Err(ArbitrationError::NoResponsibleCandidate)
        );
    }

    #[tokio::test]
    async fn empty_registry_is_an_error() {
        let registry = registry_of(vec![]);
        assert_eq!(winner(&registry).await, Err(ArbitrationError::NoCandidates));
    }

    #[tokio::test]
    async fn ties_go_to_first_registered() {
        let registry = registry_of(vec![
            Scored::new("a", 1),
            Scored::new("b", 4),
            Scored::new("c", 4),
        ]);
        assert_eq!(winner(&registry).await, Ok("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_late_candidate_still_outranks() {
        let fast = Scored::new("fast", 1);
        let slow = Scored::slow("slow", 9, 500);
        let registry = registry_of(vec![Arc::clone(&fast), Arc::clone(&slow)]);

        assert_eq!(winner(&registry).await, Ok("slow"));
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_candidate_scores_zero() {
        let registry = registry_of(vec![Scored::failing("broken"), Scored::new("ok", 1)]);
        assert_eq!(winner(&registry).await, Ok("ok"));
    }

    #[tokio::test]
    async fn responsible_keeps_every_positive_score() {
        let registry = registry_of(vec![
            Scored::new("a", 0),
            Scored::new("b", 2),
            Scored::new("c", 1),
        ]);
        let snapshot = registry.snapshot();
        let picked: Vec<_> = responsible(&snapshot, |c| async move { c.affinity().await })
            .await
            .into_iter()
            .map(|r| r.candidate.label)
            .collect();
        assert_eq!(picked, vec!["b", "c"]);
    }
}
