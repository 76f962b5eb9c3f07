//! Adaptive per-source dispatch delay.
//!
//! Tracks an exponentially-weighted success rate for each source and turns
//! it into the delay a fetch worker must wait before its next attempt:
//!
//! ```text
//! delay = clamp(base_delay * (1 + (1 - success_rate)), min_delay, max_delay)
//! ```
//!
//! Sustained failure pushes the delay towards `2 * base_delay` (or
//! `max_delay`); sustained success relaxes it back to `base_delay`. The
//! delay never reaches zero because `min_delay` is validated to be positive.
//!
//! Dispatches to one source are spaced by reserving slots: each waiter takes
//! the next free slot and pushes it forward by the current delay, so
//! concurrent workers queue up instead of firing together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateConfig;

/// Point-in-time view of one source's rate state, for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RateStats {
    pub source: String,
    pub success_rate: f64,
    pub current_delay: Duration,
    pub attempts: u64,
}

#[derive(Debug)]
struct SourceRate {
    success_rate: f64,
    attempts: u64,
    /// Earliest instant the next dispatch may go out.
    next_slot: Option<Instant>,
}

impl Default for SourceRate {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            attempts: 0,
            next_slot: None,
        }
    }
}

/// Thread-safe adaptive rate controller shared by all fetch workers.
#[derive(Clone)]
pub struct RateController {
    config: RateConfig,
    sources: Arc<Mutex<HashMap<String, SourceRate>>>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, HashMap<String, SourceRate>> {
        self.sources.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate controller mutex");
            poisoned.into_inner()
        })
    }

    fn delay_from_rate(&self, success_rate: f64) -> Duration {
        let factor = 1.0 + (1.0 - success_rate.clamp(0.0, 1.0));
        let raw = self.config.base_delay.mul_f64(factor);
        raw.clamp(self.config.min_delay, self.config.max_delay)
    }

    /// Current success rate for a source (1.0 for sources never seen).
    pub fn success_rate(&self, source: &str) -> f64 {
        self.lock_sources()
            .get(source)
            .map_or(1.0, |s| s.success_rate)
    }

    /// Delay to impose before the next dispatch to `source`.
    pub fn delay_for(&self, source: &str) -> Duration {
        self.delay_from_rate(self.success_rate(source))
    }

    /// Fold one attempt outcome into the source's success rate.
    pub fn record(&self, source: &str, success: bool) {
        let alpha = self.config.smoothing;
        let mut sources = self.lock_sources();
        let entry = sources.entry(source.to_string()).or_default();
        let sample = if success { 1.0 } else { 0.0 };
        entry.success_rate = (1.0 - alpha) * entry.success_rate + alpha * sample;
        entry.attempts += 1;
    }

    /// Reserve the next dispatch slot for `source`, returning when it comes up.
    fn reserve(&self, source: &str) -> Instant {
        let now = Instant::now();
        let mut sources = self.lock_sources();
        let entry = sources.entry(source.to_string()).or_default();
        let delay = self.delay_from_rate(entry.success_rate);
        let slot = entry.next_slot.map_or(now, |next| next.max(now));
        entry.next_slot = Some(slot + delay);
        slot
    }

    /// Wait for this source's next dispatch slot. Returns `false` if
    /// cancelled first.
    pub async fn wait(&self, source: &str, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let slot = self.reserve(source);
        let wait = slot.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return true;
        }
        tracing::debug!(%source, wait_ms = %wait.as_millis(), "Rate delay");
        tokio::select! {
            () = tokio::time::sleep_until(slot) => true,
            () = cancel.cancelled() => false,
        }
    }

    pub fn stats(&self) -> Vec<RateStats> {
        let sources = self.lock_sources();
        let mut stats: Vec<_> = sources
            .iter()
            .map(|(source, rate)| RateStats {
                source: source.clone(),
                success_rate: rate.success_rate,
                current_delay: self.delay_from_rate(rate.success_rate),
                attempts: rate.attempts,
            })
            .collect();
        stats.sort_by(|a, b| a.source.cmp(&b.source));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RateController {
        RateController::new(RateConfig {
            base_delay: Duration::from_millis(1000),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            smoothing: 0.2,
        })
    }

    #[test]
    fn unseen_source_uses_base_delay() {
        let rc = controller();
        assert_eq!(rc.success_rate("A"), 1.0);
        assert_eq!(rc.delay_for("A"), Duration::from_millis(1000));
    }

    #[test]
    fn delay_is_non_decreasing_under_failure() {
        let rc = controller();
        let mut last = rc.delay_for("A");
        for _ in 0..50 {
            rc.record("A", false);
            let next = rc.delay_for("A");
            assert!(next >= last, "{next:?} < {last:?}");
            last = next;
        }
        assert!(last > Duration::from_millis(1900));
        assert!(last <= Duration::from_millis(2000));
    }

    #[test]
    fn delay_recovers_towards_base_under_success() {
        let rc = controller();
        for _ in 0..20 {
            rc.record("A", false);
        }
        let degraded = rc.delay_for("A");
        for _ in 0..60 {
            rc.record("A", true);
        }
        let recovered = rc.delay_for("A");
        assert!(recovered < degraded);
        assert!(recovered < Duration::from_millis(1010));
        assert!(recovered >= Duration::from_millis(1000));
    }

    #[test]
    fn delay_is_clamped_and_never_zero() {
        let rc = RateController::new(RateConfig {
            base_delay: Duration::ZERO,
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(80),
            smoothing: 0.5,
        });
        assert_eq!(rc.delay_for("A"), Duration::from_millis(50));

        let rc = RateController::new(RateConfig {
            base_delay: Duration::from_millis(70),
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(80),
            smoothing: 0.5,
        });
        for _ in 0..10 {
            rc.record("A", false);
        }
        assert_eq!(rc.delay_for("A"), Duration::from_millis(80));
    }

    #[test]
    fn sources_are_tracked_independently() {
        let rc = controller();
        rc.record("A", false);
        assert!(rc.success_rate("A") < 1.0);
        assert_eq!(rc.success_rate("B"), 1.0);

        let stats = rc.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source, "A");
        assert_eq!(stats[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_interrupted_by_cancellation() {
        let rc = controller();
        let token = CancellationToken::new();
        token.cancel();
        assert!(!rc.wait("A", &token).await);

        let live = CancellationToken::new();
        assert!(rc.wait("A", &live).await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waits_are_spaced_by_the_delay() {
        let rc = controller();
        let start = Instant::now();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..3 {
            let rc = rc.clone();
            tasks.spawn(async move {
                assert!(rc.wait("A", &CancellationToken::new()).await);
                Instant::now() - start
            });
        }

        let mut offsets = tasks.join_all().await;
        offsets.sort();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_is_per_source_and_elapsed_time_counts() {
        let rc = controller();
        let token = CancellationToken::new();
        let start = Instant::now();

        assert!(rc.wait("A", &token).await);
        assert!(rc.wait("B", &token).await);
        assert_eq!(Instant::now() - start, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rc.wait("A", &token).await);
        assert_eq!(Instant::now() - start, Duration::from_millis(1000));
    }
}
