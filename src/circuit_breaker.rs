//! Shared circuit breaker: the Reconciler opens it on repeated repair
//! failures, and the Sequencer's `Collecting` stage checks it to
//! short-circuit admission while it's open. One object, two readers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
    reset_time: Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_time: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
            reset_time,
            opened_at: Mutex::new(None),
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.lock().await = None;
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            let mut opened_at = self.opened_at.lock().await;
            if opened_at.is_none() {
                *opened_at = Some(Instant::now());
            }
        }
    }

    /// `true` while the breaker is open. Auto-resets (half-open) once
    /// `reset_time` has elapsed since it tripped.
    pub async fn is_open(&self) -> bool {
        let mut opened_at = self.opened_at.lock().await;
        match *opened_at {
            Some(since) if since.elapsed() >= self.reset_time => {
                *opened_at = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure().await;
        }
        assert!(!breaker.is_open().await);
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert!(!breaker.is_open().await);
    }

    #[tokio::test]
    async fn closes_after_reset_time_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!breaker.is_open().await);
    }
}
