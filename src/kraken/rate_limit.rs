// =============================================================================
// Request Pacer — spaces Kraken REST calls to stay under the public call limit
// =============================================================================
//
// Kraken's public endpoints tolerate roughly one call per second per IP before
// answering with `EGeneral:Too many requests`. The pacer enforces a minimum
// gap between the *starts* of consecutive requests and keeps atomic counters
// that any task may read lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default minimum gap between request starts.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Async request pacer backed by a single "next allowed start" slot.
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Immutable snapshot of the pacer counters (suitable for a status payload).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacerSnapshot {
    pub min_interval_ms: u64,
    pub requests: u64,
    pub retries: u64,
    pub failures: u64,
}

impl RequestPacer {
    /// A zero interval disables pacing; counters still work.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    // -------------------------------------------------------------------------
    // Pacing
    // -------------------------------------------------------------------------

    /// Wait until this caller may start a request, then reserve the slot.
    ///
    /// Concurrent callers queue on the mutex and are released one interval
    /// apart, in arrival order.
    pub async fn acquire(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.min_interval.is_zero() {
            return;
        }

        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next {
            Some(slot) if slot > now => {
                let wait = slot - now;
                debug!(wait_ms = wait.as_millis() as u64, "pacing REST request");
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        *next = Some(start + self.min_interval);
    }

    // -------------------------------------------------------------------------
    // Outcome counters
    // -------------------------------------------------------------------------

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> PacerSnapshot {
        PacerSnapshot {
            min_interval_ms: self.min_interval.as_millis() as u64,
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("min_interval", &self.min_interval)
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .field("retries", &self.retries.load(Ordering::Relaxed))
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn consecutive_requests_are_spaced() {
        let pacer = RequestPacer::new(Duration::from_millis(1000));
        let t0 = Instant::now();

        pacer.acquire().await;
        assert_eq!(t0.elapsed(), Duration::ZERO);

        pacer.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(1000));

        pacer.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(2000));
        assert_eq!(pacer.snapshot().requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_does_not_delay_next_request() {
        let pacer = RequestPacer::new(Duration::from_millis(500));
        pacer.acquire().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let t0 = Instant::now();
        pacer.acquire().await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_disables_pacing() {
        let pacer = RequestPacer::new(Duration::ZERO);
        let t0 = Instant::now();
        for _ in 0..10 {
            pacer.acquire().await;
        }
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[test]
    fn snapshot_reports_counters() {
        let pacer = RequestPacer::default();
        pacer.record_retry();
        pacer.record_retry();
        pacer.record_failure();
        let snap = pacer.snapshot();
        assert_eq!(snap.min_interval_ms, 1000);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.requests, 0);
    }
}
