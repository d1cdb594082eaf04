//! Periodic consistency reconciler: diffs the anchor's (Layer-1) view
//! against the local (Layer-2) view and repairs the three disjoint
//! discrepancy classes. Grounded on `tree_sync_service.rs`'s
//! interval-driven `sync_once` + `backfill_pending` loop, where each tick
//! isolates its own failures (`warn!` and continue) rather than letting
//! one bad tick kill the loop.
//!
//! Discrepancies are content-addressed by `(category, id)` rather than
//! the source's data-size bucketing heuristic — see DESIGN.md for why.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::telemetry::Telemetry;
use crate::types::{now_unix, DiscrepancyCategory};

pub trait AnchorView: Send + Sync {
    fn snapshot(&self) -> impl std::future::Future<Output = HashMap<String, [u8; 32]>> + Send;
}

pub trait LocalView: Send + Sync {
    fn snapshot(&self) -> impl std::future::Future<Output = HashMap<String, [u8; 32]>> + Send;
}

#[derive(Debug, PartialEq, Eq)]
pub enum RepairError {
    Transient(String),
}

/// Executes the concrete repair action for each discrepancy class. Kept
/// separate from `AnchorSink` because reconciliation needs both read
/// (`AnchorView`) and write access, whereas the hot-path sequencer only
/// ever writes.
pub trait Repairer: Send + Sync {
    fn resubmit(&self, id: &str) -> impl std::future::Future<Output = Result<(), RepairError>> + Send;
    fn ingest(&self, id: &str) -> impl std::future::Future<Output = Result<(), RepairError>> + Send;
    fn reconcile(&self, id: &str) -> impl std::future::Future<Output = Result<(), RepairError>> + Send;
}

struct FailureEntry {
    attempts: u32,
    last_attempt: Instant,
}

struct ReconcilerSnapshot {
    taken_at: u64,
    anchor: HashMap<String, [u8; 32]>,
    local: HashMap<String, [u8; 32]>,
}

pub struct ReconcilerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset: Duration,
    pub snapshot_interval: Duration,
    pub max_snapshots: usize,
}

pub struct Reconciler<A: AnchorView, L: LocalView, R: Repairer> {
    anchor_view: Arc<A>,
    local_view: Arc<L>,
    repairer: Arc<R>,
    breaker: Arc<CircuitBreaker>,
    config: ReconcilerConfig,
    failing: DashMap<String, FailureEntry>,
    snapshots: tokio::sync::Mutex<VecDeque<ReconcilerSnapshot>>,
    last_snapshot_at: tokio::sync::Mutex<Instant>,
    telemetry: Telemetry,
}

impl<A: AnchorView + 'static, L: LocalView + 'static, R: Repairer + 'static> Reconciler<A, L, R> {
    pub fn new(
        anchor_view: Arc<A>,
        local_view: Arc<L>,
        repairer: Arc<R>,
        breaker: Arc<CircuitBreaker>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            anchor_view,
            local_view,
            repairer,
            breaker,
            config,
            failing: DashMap::new(),
            snapshots: tokio::sync::Mutex::new(VecDeque::new()),
            last_snapshot_at: tokio::sync::Mutex::new(Instant::now()),
            telemetry: Telemetry,
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            loop {
                tick.tick().await;
                if self.breaker.is_open().await {
                    continue;
                }
                if let Err(e) = self.run_tick().await {
                    warn!(error = %e, "reconciliation tick failed");
                }
            }
        });
    }

    async fn run_tick(&self) -> Result<(), String> {
        let anchor = self.anchor_view.snapshot().await;
        let local = self.local_view.snapshot().await;

        self.maybe_snapshot(&anchor, &local).await;

        let mut missing_in_anchor = Vec::new();
        let mut missing_in_local = Vec::new();
        let mut inconsistent = Vec::new();

        for (id, local_digest) in &local {
            match anchor.get(id) {
                None => missing_in_anchor.push(id.clone()),
                Some(anchor_digest) if anchor_digest != local_digest => inconsistent.push(id.clone()),
                _ => {}
            }
        }
        for id in anchor.keys() {
            if !local.contains_key(id) {
                missing_in_local.push(id.clone());
            }
        }

        for id in missing_in_anchor {
            if !self.due(DiscrepancyCategory::MissingInAnchor, &id) {
                continue;
            }
            let result = self.repairer.resubmit(&id).await;
            self.record_outcome(DiscrepancyCategory::MissingInAnchor, &id, result).await;
        }
        for id in missing_in_local {
            if !self.due(DiscrepancyCategory::MissingInLocal, &id) {
                continue;
            }
            let result = self.repairer.ingest(&id).await;
            self.record_outcome(DiscrepancyCategory::MissingInLocal, &id, result).await;
        }
        for id in inconsistent {
            if !self.due(DiscrepancyCategory::Inconsistent, &id) {
                continue;
            }
            let result = self.repairer.reconcile(&id).await;
            self.record_outcome(DiscrepancyCategory::Inconsistent, &id, result).await;
        }

        Ok(())
    }

    fn due(&self, category: DiscrepancyCategory, id: &str) -> bool {
        let key = format!("{category:?}:{id}");
        match self.failing.get(&key) {
            Some(entry) => {
                let backoff = Duration::from_secs(2u64.saturating_pow(entry.attempts));
                entry.last_attempt.elapsed() >= backoff
            }
            None => true,
        }
    }

    async fn record_outcome(&self, category: DiscrepancyCategory, id: &str, result: Result<(), RepairError>) {
        let key = format!("{category:?}:{id}");
        match result {
            Ok(()) => {
                self.failing.remove(&key);
                self.breaker.record_success().await;
                self.telemetry.record_reconciler_repair(category_label(category));
                info!(category = ?category, id, "reconciler repair succeeded");
            }
            Err(RepairError::Transient(msg)) => {
                self.breaker.record_failure().await;
                let attempts = {
                    let mut entry = self.failing.entry(key.clone()).or_insert(FailureEntry {
                        attempts: 0,
                        last_attempt: Instant::now(),
                    });
                    entry.attempts += 1;
                    entry.last_attempt = Instant::now();
                    entry.attempts
                };
                if attempts >= self.config.max_attempts {
                    self.failing.remove(&key);
                    error!(category = ?category, id, attempts, error = msg, "discrepancy repair permanently failed");
                } else {
                    warn!(category = ?category, id, attempts, error = msg, "discrepancy repair failed, will retry");
                }
            }
        }
    }

    async fn maybe_snapshot(&self, anchor: &HashMap<String, [u8; 32]>, local: &HashMap<String, [u8; 32]>) {
        let mut last = self.last_snapshot_at.lock().await;
        if last.elapsed() < self.config.snapshot_interval {
            return;
        }
        *last = Instant::now();
        let mut snapshots = self.snapshots.lock().await;
        if snapshots.len() >= self.config.max_snapshots {
            snapshots.pop_front();
        }
        snapshots.push_back(ReconcilerSnapshot {
            taken_at: now_unix(),
            anchor: anchor.clone(),
            local: local.clone(),
        });
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.lock().await.len()
    }
}

fn category_label(category: DiscrepancyCategory) -> &'static str {
    match category {
        DiscrepancyCategory::MissingInAnchor => "resubmit",
        DiscrepancyCategory::MissingInLocal => "ingest",
        DiscrepancyCategory::Inconsistent => "reconcile",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedAnchor(HashMap<String, [u8; 32]>);
    impl AnchorView for FixedAnchor {
        async fn snapshot(&self) -> HashMap<String, [u8; 32]> {
            self.0.clone()
        }
    }

    struct FixedLocal(HashMap<String, [u8; 32]>);
    impl LocalView for FixedLocal {
        async fn snapshot(&self) -> HashMap<String, [u8; 32]> {
            self.0.clone()
        }
    }

    struct CountingRepairer {
        resubmits: AtomicU32,
        ingests: AtomicU32,
        reconciles: AtomicU32,
    }

    impl Repairer for CountingRepairer {
        async fn resubmit(&self, _id: &str) -> Result<(), RepairError> {
            self.resubmits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn ingest(&self, _id: &str) -> Result<(), RepairError> {
            self.ingests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn reconcile(&self, _id: &str) -> Result<(), RepairError> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn cfg() -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_millis(10),
            max_attempts: 5,
            circuit_breaker_threshold: 10,
            circuit_breaker_reset: Duration::from_secs(300),
            snapshot_interval: Duration::from_secs(3600),
            max_snapshots: 24,
        }
    }

    #[tokio::test]
    async fn classifies_and_repairs_all_three_discrepancy_kinds() {
        let anchor = Arc::new(FixedAnchor(HashMap::from([
            ("only-anchor".to_string(), [1u8; 32]),
            ("both".to_string(), [2u8; 32]),
        ])));
        let local = Arc::new(FixedLocal(HashMap::from([
            ("only-local".to_string(), [3u8; 32]),
            ("both".to_string(), [9u8; 32]),
        ])));
        let repairer = Arc::new(CountingRepairer {
            resubmits: AtomicU32::new(0),
            ingests: AtomicU32::new(0),
            reconciles: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(300)));
        let reconciler = Reconciler::new(anchor, local, Arc::clone(&repairer), breaker, cfg());

        reconciler.run_tick().await.unwrap();

        assert_eq!(repairer.resubmits.load(Ordering::SeqCst), 1);
        assert_eq!(repairer.ingests.load(Ordering::SeqCst), 1);
        assert_eq!(repairer.reconciles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotent_rerun_does_not_repeat_repairs_once_consistent() {
        let state = HashMap::from([("batch-1".to_string(), [7u8; 32])]);
        let anchor = Arc::new(FixedAnchor(state.clone()));
        let local = Arc::new(FixedLocal(state));
        let repairer = Arc::new(CountingRepairer {
            resubmits: AtomicU32::new(0),
            ingests: AtomicU32::new(0),
            reconciles: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(300)));
        let reconciler = Reconciler::new(anchor, local, Arc::clone(&repairer), breaker, cfg());

        reconciler.run_tick().await.unwrap();
        reconciler.run_tick().await.unwrap();

        assert_eq!(repairer.resubmits.load(Ordering::SeqCst), 0);
        assert_eq!(repairer.ingests.load(Ordering::SeqCst), 0);
        assert_eq!(repairer.reconciles.load(Ordering::SeqCst), 0);
    }
}
