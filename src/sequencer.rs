//! Orchestrates worker lanes, batch formation, commitment, signing, and
//! submission. Grounded on the teacher's `main.rs` wiring (constructing
//! the queue, store, and prover, then spawning their background loops)
//! and `prover.rs::process_batch`'s staged status-transition shape
//! (`Pending -> Signing -> Submitted -> Confirmed/Failed`, driven from one
//! `run` loop).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest as _, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::account_state::AccountState;
use crate::anchor::{self, AnchorMetadata, AnchorSink};
use crate::circuit_breaker::CircuitBreaker;
use crate::executor::Executor;
use crate::merkle::MerkleEngine;
use crate::signing::SigningService;
use crate::store::{BatchStatusUpdate, BatchStore, InMemoryStore, TransactionStore};
use crate::telemetry::Telemetry;
use crate::types::{now_unix, Batch, BatchStatus, Transaction, TransactionStatus};
use crate::validator::Validator;

pub struct SequencerConfig {
    pub batch_size: usize,
    pub max_batch_window: Duration,
    pub max_concurrent_batches: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub worker_count: usize,
    pub priority_tier_count: u8,
    pub fairness_credit_limit: u32,
    pub fairness_credit_window: Duration,
}

struct AdmittedTx {
    tx: Transaction,
    arrival_index: u64,
}

pub struct Sequencer<S: AnchorSink> {
    ring_queue: Arc<crate::ring_queue::RingQueue<Transaction>>,
    account_state: Arc<AccountState>,
    validator: Arc<Validator>,
    executor: Arc<Executor>,
    merkle: Arc<MerkleEngine>,
    signing: Arc<SigningService>,
    anchor_sink: Arc<S>,
    store: Arc<InMemoryStore>,
    telemetry: Telemetry,
    config: SequencerConfig,
    arrival_counter: AtomicU64,
    admission_breaker: Arc<CircuitBreaker>,
    concurrency: Arc<Semaphore>,
    fairness: DashMap<String, (u32, Instant)>,
    deferred: Mutex<Vec<Transaction>>,
    pub batches: DashMap<String, Batch>,
    admitted_prefix: Mutex<Vec<String>>,
    tx_leaf_index: DashMap<String, usize>,
}

impl<S: AnchorSink + 'static> Sequencer<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring_queue: Arc<crate::ring_queue::RingQueue<Transaction>>,
        account_state: Arc<AccountState>,
        validator: Arc<Validator>,
        executor: Arc<Executor>,
        merkle: Arc<MerkleEngine>,
        signing: Arc<SigningService>,
        anchor_sink: Arc<S>,
        store: Arc<InMemoryStore>,
        admission_breaker: Arc<CircuitBreaker>,
        config: SequencerConfig,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_batches));
        Self {
            ring_queue,
            account_state,
            validator,
            executor,
            merkle,
            signing,
            anchor_sink,
            store,
            telemetry: Telemetry,
            config,
            arrival_counter: AtomicU64::new(0),
            admission_breaker,
            concurrency,
            fairness: DashMap::new(),
            deferred: Mutex::new(Vec::new()),
            batches: DashMap::new(),
            admitted_prefix: Mutex::new(Vec::new()),
            tx_leaf_index: DashMap::new(),
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if self.admission_breaker.is_open().await {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                let admitted = self.collect_batch().await;
                if admitted.is_empty() {
                    continue;
                }
                let permit = match Arc::clone(&self.concurrency).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    this.build_sign_submit(admitted).await;
                });
            }
        });
    }

    fn fairness_exceeded(&self, sender: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .fairness
            .entry(sender.to_string())
            .or_insert((0, now));
        if now.duration_since(entry.1) >= self.config.fairness_credit_window {
            entry.0 = 0;
            entry.1 = now;
        }
        entry.0 >= self.config.fairness_credit_limit
    }

    fn record_fairness(&self, sender: &str) {
        if let Some(mut entry) = self.fairness.get_mut(sender) {
            entry.0 += 1;
        }
    }

    /// Tier index for `tx`, clamped into `[0, priority_tier_count)`. Higher
    /// is more urgent; the top tier is treated as "high priority".
    fn tier_of(&self, tx: &Transaction) -> u8 {
        let max_tier = self.config.priority_tier_count.saturating_sub(1);
        tx.priority.min(max_tier)
    }

    fn is_high_priority(&self, tx: &Transaction) -> bool {
        self.config.priority_tier_count > 0
            && self.tier_of(tx) == self.config.priority_tier_count.saturating_sub(1)
    }

    fn worker_lane_count(&self, item_count: usize) -> usize {
        self.config.worker_count.max(1).min(item_count.max(1))
    }

    /// Drains the ring queue into a batch, validates candidates across
    /// round-robin worker lanes (`Config::worker_count` lanes, each running
    /// the Validator stage for its share concurrently with the others), and
    /// cuts the batch once size, window, or a high-priority transaction
    /// demands it. Admission order within the batch serves higher priority
    /// tiers first and FIFO within a tier — lane completion order never
    /// affects the result, only each candidate's recorded arrival index
    /// does.
    async fn collect_batch(&self) -> Vec<AdmittedTx> {
        let deadline = Instant::now() + self.config.max_batch_window;

        let deferred: Vec<Transaction> = std::mem::take(&mut *self.deferred.lock().await);
        let mut candidates: std::collections::VecDeque<Transaction> = deferred.into();

        let mut raw: Vec<(u64, Transaction)> = Vec::new();
        loop {
            if raw.len() >= self.config.batch_size {
                break;
            }
            let candidate = if let Some(tx) = candidates.pop_front() {
                Some(tx)
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    None
                } else {
                    match tokio::time::timeout(remaining, self.ring_queue.dequeue()).await {
                        Ok(Ok(tx)) => Some(tx),
                        Ok(Err(_closed)) => None,
                        Err(_elapsed) => None,
                    }
                }
            };

            let Some(tx) = candidate else {
                break;
            };

            if self.fairness_exceeded(&tx.sender) {
                self.deferred.lock().await.push(tx);
                continue;
            }

            let arrival_index = self.arrival_counter.fetch_add(1, Ordering::SeqCst);
            let high_priority = self.is_high_priority(&tx);
            raw.push((arrival_index, tx));

            if high_priority {
                break;
            }
            if Instant::now() >= deadline && !raw.is_empty() {
                break;
            }
        }

        if raw.is_empty() {
            return Vec::new();
        }

        // Round-robin the drained candidates across worker lanes; each lane
        // validates its share sequentially, lanes run concurrently. The
        // final order is restored by arrival_index below, not by whichever
        // lane happened to finish first.
        let lane_count = self.worker_lane_count(raw.len());
        let mut lanes: Vec<Vec<(u64, Transaction)>> = (0..lane_count).map(|_| Vec::new()).collect();
        for (i, item) in raw.into_iter().enumerate() {
            lanes[i % lane_count].push(item);
        }

        let mut joins = JoinSet::new();
        for lane in lanes {
            let validator = Arc::clone(&self.validator);
            joins.spawn(async move {
                let mut results = Vec::with_capacity(lane.len());
                for (arrival_index, tx) in lane {
                    let outcome = validator.validate(&tx).await;
                    results.push((arrival_index, tx, outcome));
                }
                results
            });
        }

        let mut validated = Vec::new();
        while let Some(lane_result) = joins.join_next().await {
            if let Ok(lane_results) = lane_result {
                validated.extend(lane_results);
            }
        }
        validated.sort_by_key(|(arrival_index, ..)| *arrival_index);

        let mut admitted = Vec::new();
        for (arrival_index, tx, outcome) in validated {
            match outcome {
                Ok(()) => {
                    self.record_fairness(&tx.sender);
                    self.telemetry.record_transaction("admitted");
                    let _ = self
                        .store
                        .update_transaction_status(&tx.id, TransactionStatus::Admitted, None, None)
                        .await;
                    admitted.push(AdmittedTx { tx, arrival_index });
                }
                Err(err) => {
                    self.telemetry.record_transaction("rejected");
                    let _ = self
                        .store
                        .update_transaction_status(
                            &tx.id,
                            TransactionStatus::Rejected,
                            None,
                            Some(err.to_string()),
                        )
                        .await;
                    warn!(error = %err, "transaction rejected during admission");
                }
            }
        }

        // Serve higher priority tiers first; within a tier, preserve the
        // FIFO arrival order already established above.
        admitted.sort_by_key(|a| (std::cmp::Reverse(self.tier_of(&a.tx)), a.arrival_index));
        admitted
    }

    async fn build_sign_submit(&self, admitted: Vec<AdmittedTx>) {
        let batch_start = Instant::now();
        let batch_id = Uuid::new_v4().to_string();

        // Round-robin the admitted set (already in final priority/arrival
        // order) across worker lanes for parallel Validator->Executor
        // fan-out. `seq` is each item's position in that final order and is
        // the merge key used to reassemble results afterward, so the
        // batch's transaction order never depends on lane completion
        // timing. Executor application itself is race-safe across lanes:
        // `AccountState::execute_locked` holds the touched address pair's
        // lock across the snapshot read, the compute, and the write, so two
        // lanes crediting the same account always serialize on that pair
        // rather than racing a stale snapshot.
        let lane_count = self.worker_lane_count(admitted.len());
        let mut lanes: Vec<Vec<(usize, Transaction)>> = (0..lane_count).map(|_| Vec::new()).collect();
        for (seq, item) in admitted.into_iter().enumerate() {
            lanes[seq % lane_count].push((seq, item.tx));
        }

        let mut joins = JoinSet::new();
        for lane in lanes {
            let account_state = Arc::clone(&self.account_state);
            let executor = Arc::clone(&self.executor);
            joins.spawn(async move {
                let mut results = Vec::with_capacity(lane.len());
                for (seq, tx) in lane {
                    let (deltas, receipt) = account_state
                        .execute_locked(&tx.sender, &tx.recipient, |sender, recipient| {
                            executor.execute_with_retry(&tx, &sender, &recipient)
                        })
                        .await;
                    results.push((seq, tx, deltas, receipt));
                }
                results
            });
        }

        let mut executed = Vec::new();
        while let Some(lane_result) = joins.join_next().await {
            if let Ok(lane_results) = lane_result {
                executed.extend(lane_results);
            }
        }
        executed.sort_by_key(|(seq, ..)| *seq);

        let mut tx_ids = Vec::with_capacity(executed.len());
        let mut leaves = Vec::with_capacity(executed.len() * 2);
        let leaf_offset = self.merkle.leaf_count();

        for (_, tx, deltas, receipt) in &executed {
            if deltas.is_empty() {
                self.telemetry.record_transaction("execution_failed");
                let _ = self
                    .store
                    .update_transaction_status(
                        &tx.id,
                        TransactionStatus::Rejected,
                        None,
                        receipt.error.clone(),
                    )
                    .await;
                warn!(tx_id = %tx.id, error = ?receipt.error, "execution failed, tx dropped from batch");
                continue;
            }
            let first_leaf_index = leaf_offset + leaves.len();
            for delta in deltas {
                leaves.push(leaf_digest(&delta.key, delta.value));
            }
            self.tx_leaf_index.insert(tx.id.clone(), first_leaf_index);
            tx_ids.push(tx.id.clone());
        }

        if tx_ids.is_empty() {
            return;
        }

        self.merkle.append_leaves(leaves);
        let root = self.merkle.root();

        let mut batch = Batch {
            id: batch_id.clone(),
            merkle_root: root,
            tx_ids: tx_ids.clone(),
            status: BatchStatus::Signing,
            created_at: now_unix(),
            submitted_at: None,
            confirmed_at: None,
            anchor_signature: None,
            error: None,
        };
        self.batches.insert(batch_id.clone(), batch.clone());
        let _ = self.store.save_batch(&batch).await;
        self.telemetry.record_batch("building");
        for tx_id in &tx_ids {
            let _ = self
                .store
                .update_transaction_status(tx_id, TransactionStatus::Executed, Some(batch_id.clone()), None)
                .await;
        }

        let signature = match self.signing.sign(&root).await {
            Ok((sig, _key_id)) => sig,
            Err(err) => {
                batch.status = BatchStatus::Failed;
                batch.error = Some(err.to_string());
                self.batches.insert(batch_id.clone(), batch);
                self.fail_batch(&batch_id, &tx_ids, &err.to_string()).await;
                self.telemetry.record_batch("failed");
                return;
            }
        };
        batch.anchor_signature = Some(signature.clone());
        batch.status = BatchStatus::Submitted;
        batch.submitted_at = Some(now_unix());
        self.batches.insert(batch_id.clone(), batch.clone());
        let _ = self
            .store
            .update_batch_status(
                &batch_id,
                BatchStatus::Submitted,
                BatchStatusUpdate {
                    submitted_at: batch.submitted_at,
                    anchor_signature: Some(signature.clone()),
                    ..Default::default()
                },
            )
            .await;

        let metadata = AnchorMetadata {
            tx_count: tx_ids.len(),
            batch_created_at: batch.created_at,
        };
        let result = anchor::submit_with_retry(
            &*self.anchor_sink,
            &batch_id,
            root,
            &signature,
            &metadata,
            self.config.max_retries,
            self.config.retry_base_delay,
        )
        .await;

        match result {
            Ok(()) => {
                batch.status = BatchStatus::Confirmed;
                batch.confirmed_at = Some(now_unix());
                self.admission_breaker.record_success().await;
                self.admitted_prefix.lock().await.extend(tx_ids.clone());
                let _ = self
                    .store
                    .update_batch_status(
                        &batch_id,
                        BatchStatus::Confirmed,
                        BatchStatusUpdate { confirmed_at: batch.confirmed_at, ..Default::default() },
                    )
                    .await;
                for tx_id in &tx_ids {
                    let _ = self
                        .store
                        .update_transaction_status(
                            tx_id,
                            TransactionStatus::Confirmed,
                            Some(batch_id.clone()),
                            None,
                        )
                        .await;
                }
                self.telemetry.record_batch("confirmed");
                info!(batch_id, "batch confirmed");
            }
            Err(err) => {
                batch.status = BatchStatus::Failed;
                batch.error = Some(err.to_string());
                self.admission_breaker.record_failure().await;
                self.fail_batch(&batch_id, &tx_ids, &err.to_string()).await;
                self.telemetry.record_batch("failed");
                warn!(batch_id, error = %err, "batch failed to anchor");
            }
        }
        self.batches.insert(batch_id, batch);
        self.telemetry.record_batch_processing(batch_start.elapsed());
    }

    /// Records a whole-batch failure: the batch row moves to `Failed` and
    /// every transaction it carried moves to `Rejected` with the same
    /// reason, since a batch that never anchors leaves nothing confirmed.
    async fn fail_batch(&self, batch_id: &str, tx_ids: &[String], reason: &str) {
        let _ = self
            .store
            .update_batch_status(
                batch_id,
                BatchStatus::Failed,
                BatchStatusUpdate { error: Some(reason.to_string()), ..Default::default() },
            )
            .await;
        for tx_id in tx_ids {
            let _ = self
                .store
                .update_transaction_status(tx_id, TransactionStatus::Rejected, None, Some(reason.to_string()))
                .await;
        }
    }

    pub async fn confirmed_prefix(&self) -> Vec<String> {
        self.admitted_prefix.lock().await.clone()
    }

    /// Root and Merkle proof for a committed transaction's first leaf, if
    /// its batch has run. Proofs are presented together with the root they
    /// were generated against since the proof cache may go stale between an
    /// update and its invalidation.
    pub fn proof_for_tx(&self, tx_id: &str) -> Option<(crate::merkle::Digest, crate::merkle::Proof)> {
        let index = *self.tx_leaf_index.get(tx_id)?;
        let proof = self.merkle.get_proof(index).ok()?;
        Some((self.merkle.root(), proof))
    }
}

impl<S: AnchorSink + 'static> crate::reconciler::LocalView for Sequencer<S> {
    async fn snapshot(&self) -> std::collections::HashMap<String, [u8; 32]> {
        self.batches
            .iter()
            .filter(|entry| entry.value().status == crate::types::BatchStatus::Confirmed)
            .map(|entry| (entry.key().clone(), entry.value().merkle_root))
            .collect()
    }
}

fn leaf_digest(key: &str, value: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(value.to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::InProcessAnchorSink;
    use crate::merkle::MerkleOptions;
    use crate::ring_queue::RingQueue;
    use crate::signing::EmergencyLimits;
    use crate::types::TransactionKind;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn signed_tx(signing_key: &SigningKey, recipient: &str, amount: u64, nonce: u64, priority: u8) -> Transaction {
        let sender = hex::encode(signing_key.verifying_key().to_bytes());
        let mut tx = Transaction {
            id: Uuid::new_v4().to_string(),
            sender,
            recipient: recipient.to_string(),
            amount,
            nonce,
            expiry_timestamp: now_unix() + 3600,
            kind: TransactionKind::Transfer,
            payload: Vec::new(),
            signature: Vec::new(),
            priority,
        };
        let sig = signing_key.sign(&tx.canonical_bytes());
        tx.signature = sig.to_bytes().to_vec();
        tx
    }

    fn test_config() -> SequencerConfig {
        SequencerConfig {
            batch_size: 10,
            max_batch_window: Duration::from_millis(50),
            max_concurrent_batches: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            worker_count: 4,
            priority_tier_count: 3,
            fairness_credit_limit: 10,
            fairness_credit_window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn single_transfer_confirms_and_updates_balances() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let account_state = Arc::new(AccountState::new());
        let sender_addr = hex::encode(signing_key.verifying_key().to_bytes());
        account_state.credit(&sender_addr, 100);

        let validator = Arc::new(Validator::new(
            Arc::clone(&account_state),
            Duration::from_secs(600),
            100,
            5000,
        ));
        let executor = Arc::new(Executor::new(Duration::from_secs(10), 3, Duration::from_millis(1)));
        let merkle = Arc::new(
            MerkleEngine::new(vec![[0u8; 32]], MerkleOptions::default()).unwrap(),
        );
        let signing = Arc::new(SigningService::new(
            EmergencyLimits::default(),
            3,
            Duration::from_millis(1),
        ));
        let anchor_sink = Arc::new(InProcessAnchorSink::new());
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(300)));
        let queue = Arc::new(RingQueue::new(16));

        let sequencer = Arc::new(Sequencer::new(
            Arc::clone(&queue),
            account_state.clone(),
            validator,
            executor,
            merkle,
            signing,
            anchor_sink,
            store.clone(),
            breaker,
            test_config(),
        ));
        Arc::clone(&sequencer).spawn();

        let tx = signed_tx(&signing_key, "recipient-B", 10, 1, 0);
        let tx_id = tx.id.clone();
        store.save_transaction(&tx, TransactionStatus::Pending).await.unwrap();
        queue.enqueue(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let sender = account_state.get(&sender_addr);
        let recipient = account_state.get("recipient-B");
        assert_eq!(sender.balance, 90);
        assert_eq!(recipient.balance, 10);
        assert_eq!(sequencer.confirmed_prefix().await.len(), 1);

        let stored = store.get_transaction(&tx_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Confirmed);
        assert!(stored.batch_id.is_some());
    }

    #[tokio::test]
    async fn worker_lanes_merge_execution_results_by_arrival_order() {
        let signing_key_a = SigningKey::generate(&mut OsRng);
        let signing_key_b = SigningKey::generate(&mut OsRng);
        let account_state = Arc::new(AccountState::new());
        let addr_a = hex::encode(signing_key_a.verifying_key().to_bytes());
        let addr_b = hex::encode(signing_key_b.verifying_key().to_bytes());
        account_state.credit(&addr_a, 100);
        account_state.credit(&addr_b, 100);

        let validator = Arc::new(Validator::new(
            Arc::clone(&account_state),
            Duration::from_secs(600),
            1000,
            50_000,
        ));
        let executor = Arc::new(Executor::new(Duration::from_secs(10), 3, Duration::from_millis(1)));
        let merkle = Arc::new(MerkleEngine::new(vec![[0u8; 32]], MerkleOptions::default()).unwrap());
        let signing = Arc::new(SigningService::new(EmergencyLimits::default(), 3, Duration::from_millis(1)));
        let anchor_sink = Arc::new(InProcessAnchorSink::new());
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(300)));
        let queue = Arc::new(RingQueue::new(16));

        let mut config = test_config();
        config.worker_count = 4;
        config.max_batch_window = Duration::from_millis(100);

        let sequencer = Arc::new(Sequencer::new(
            Arc::clone(&queue),
            account_state.clone(),
            validator,
            executor,
            merkle,
            signing,
            anchor_sink,
            store.clone(),
            breaker,
            config,
        ));
        Arc::clone(&sequencer).spawn();

        // Both senders credit the same pool address concurrently across
        // worker lanes; `execute_locked` must serialize them correctly.
        for (key, addr) in [(&signing_key_a, &addr_a), (&signing_key_b, &addr_b)] {
            let _ = addr;
            let tx = signed_tx(key, "pool", 10, 1, 0);
            store.save_transaction(&tx, TransactionStatus::Pending).await.unwrap();
            queue.enqueue(tx).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let pool = account_state.get("pool");
        assert_eq!(pool.balance, 20);
        assert_eq!(sequencer.confirmed_prefix().await.len(), 1);
    }
}
