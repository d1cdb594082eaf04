//! Persistent state layout per the `transactions`/`batches`/`accounts`/
//! `audit_events` tables. Grounded on the teacher's `BatchStore`/
//! `IdempotencyStore`/`RateLimitStore`/`NoteStore` trait family: one trait
//! per table, an `InMemoryStore` backed by `dashmap`, and a `redis`
//! feature-gated backend with the identical method shapes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::Config;
use crate::types::{AuditEvent, Batch, BatchStatus, Transaction, TransactionStatus};

// ---------------------------------------------------------------------------
// Trait definitions — one per persistent table
// ---------------------------------------------------------------------------

pub trait TransactionStore: Send + Sync + 'static {
    fn save_transaction(
        &self,
        tx: &Transaction,
        status: TransactionStatus,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_transaction(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredTransaction>, StoreError>> + Send;

    fn update_transaction_status(
        &self,
        id: &str,
        status: TransactionStatus,
        batch_id: Option<String>,
        error: Option<String>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

pub trait BatchStore: Send + Sync + 'static {
    fn save_batch(
        &self,
        batch: &Batch,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_batch(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Batch>, StoreError>> + Send;

    fn update_batch_status(
        &self,
        id: &str,
        status: BatchStatus,
        extra: BatchStatusUpdate,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

pub trait AccountStore: Send + Sync + 'static {
    fn save_account(
        &self,
        address: &str,
        balance: u64,
        nonce: u64,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_account(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Option<(u64, u64)>, StoreError>> + Send;
}

pub trait AuditStore: Send + Sync + 'static {
    fn append_audit(
        &self,
        event: &AuditEvent,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn list_audit_by_kind(
        &self,
        kind: &str,
    ) -> impl std::future::Future<Output = Result<Vec<AuditEvent>, StoreError>> + Send;
}

pub trait IdempotencyStore: Send + Sync + 'static {
    /// Returns `Some(cached_result)` if the key was already set, else sets it and returns `None`.
    fn check_and_set(
        &self,
        key: &str,
        result: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;
}

pub trait RateLimitStore: Send + Sync + 'static {
    /// Returns `true` if the request is allowed, `false` if rate-limited.
    fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx: Transaction,
    pub status: TransactionStatus,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub batch_id: Option<String>,
    pub error: Option<String>,
}

/// Extra fields to set when updating batch status.
#[derive(Default)]
pub struct BatchStatusUpdate {
    pub submitted_at: Option<u64>,
    pub confirmed_at: Option<u64>,
    pub anchor_signature: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

const MAX_IDEMPOTENCY_ENTRIES: usize = 50_000;
const IDEMPOTENCY_TTL_SECS: u64 = 3600;
const RATE_LIMIT_EVICTION_SECS: u64 = 3600;

pub struct InMemoryStore {
    transactions: DashMap<String, StoredTransaction>,
    batches: DashMap<String, Batch>,
    accounts: DashMap<String, (u64, u64)>,
    audit_events: DashMap<String, Vec<AuditEvent>>,
    idempotency: DashMap<String, (String, u64)>,
    rate_limits: DashMap<String, (u32, u64)>,
    eviction_counter: std::sync::atomic::AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            batches: DashMap::new(),
            accounts: DashMap::new(),
            audit_events: DashMap::new(),
            idempotency: DashMap::new(),
            rate_limits: DashMap::new(),
            eviction_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Spawns a background task that periodically evicts expired entries.
    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                store.evict_expired();
            }
        });
    }

    fn evict_expired(&self) {
        let now = now_epoch();

        let before = self.idempotency.len();
        self.idempotency
            .retain(|_, (_, created)| now.saturating_sub(*created) < IDEMPOTENCY_TTL_SECS);
        let evicted_idem = before - self.idempotency.len();

        let before = self.rate_limits.len();
        self.rate_limits
            .retain(|_, (_, window_start)| now.saturating_sub(*window_start) < RATE_LIMIT_EVICTION_SECS);
        let evicted_rl = before - self.rate_limits.len();

        let before = self.batches.len();
        self.batches.retain(|_, rec| {
            matches!(rec.status, BatchStatus::Pending | BatchStatus::Signing | BatchStatus::Submitted)
                || now.saturating_sub(rec.created_at) < 86400
        });
        let evicted_batches = before - self.batches.len();

        if evicted_idem + evicted_rl + evicted_batches > 0 {
            debug!(evicted_idem, evicted_rl, evicted_batches, "store eviction complete");
        }
    }
}

impl TransactionStore for InMemoryStore {
    async fn save_transaction(&self, tx: &Transaction, status: TransactionStatus) -> Result<(), StoreError> {
        self.transactions.insert(
            tx.id.clone(),
            StoredTransaction {
                tx: tx.clone(),
                status,
                created_at: now_epoch(),
                processed_at: None,
                batch_id: None,
                error: None,
            },
        );
        Ok(())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<StoredTransaction>, StoreError> {
        Ok(self.transactions.get(id).map(|r| r.value().clone()))
    }

    async fn update_transaction_status(
        &self,
        id: &str,
        status: TransactionStatus,
        batch_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .transactions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        entry.status = status;
        entry.processed_at = Some(now_epoch());
        if batch_id.is_some() {
            entry.batch_id = batch_id;
        }
        if error.is_some() {
            entry.error = error;
        }
        Ok(())
    }
}

impl BatchStore for InMemoryStore {
    async fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        self.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        Ok(self.batches.get(id).map(|r| r.value().clone()))
    }

    async fn update_batch_status(
        &self,
        id: &str,
        status: BatchStatus,
        extra: BatchStatusUpdate,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .batches
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        entry.status = status;
        if let Some(v) = extra.submitted_at {
            entry.submitted_at = Some(v);
        }
        if let Some(v) = extra.confirmed_at {
            entry.confirmed_at = Some(v);
        }
        if let Some(v) = extra.anchor_signature {
            entry.anchor_signature = Some(v);
        }
        if let Some(v) = extra.error {
            entry.error = Some(v);
        }
        Ok(())
    }
}

impl AccountStore for InMemoryStore {
    async fn save_account(&self, address: &str, balance: u64, nonce: u64) -> Result<(), StoreError> {
        self.accounts.insert(address.to_string(), (balance, nonce));
        Ok(())
    }

    async fn get_account(&self, address: &str) -> Result<Option<(u64, u64)>, StoreError> {
        Ok(self.accounts.get(address).map(|r| *r.value()))
    }
}

impl AuditStore for InMemoryStore {
    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.audit_events
            .entry(event.kind.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_audit_by_kind(&self, kind: &str) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self.audit_events.get(kind).map(|r| r.value().clone()).unwrap_or_default())
    }
}

impl IdempotencyStore for InMemoryStore {
    async fn check_and_set(&self, key: &str, result: &str) -> Result<Option<String>, StoreError> {
        use dashmap::mapref::entry::Entry;
        let now = now_epoch();

        // Atomic check-and-set via DashMap's entry API to prevent TOCTOU races.
        // Two concurrent submissions with the same key will serialize on the
        // shard lock, so exactly one will insert and the other will see the
        // existing value.
        let outcome = match self.idempotency.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let (ref cached_result, created) = *occ.get();
                if now.saturating_sub(created) < IDEMPOTENCY_TTL_SECS {
                    Some(cached_result.clone())
                } else {
                    occ.insert((result.to_string(), now));
                    None
                }
            }
            Entry::Vacant(vac) => {
                vac.insert((result.to_string(), now));
                None
            }
        };

        let count = self
            .eviction_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count % 100 == 0 && self.idempotency.len() > MAX_IDEMPOTENCY_ENTRIES {
            self.idempotency
                .retain(|_, (_, created)| now.saturating_sub(*created) < IDEMPOTENCY_TTL_SECS);
        }

        Ok(outcome)
    }
}

impl RateLimitStore for InMemoryStore {
    async fn check_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut entry = self.rate_limits.entry(key.to_string()).or_insert((0, now));
        let (count, window_start) = entry.value_mut();

        if now - *window_start >= window_secs {
            *count = 0;
            *window_start = now;
        }

        if *count >= limit {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Redis implementation (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "redis")]
pub struct RedisStore {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl BatchStore for RedisStore {
    async fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(batch).map_err(|e| StoreError::Backend(e.to_string()))?;
        redis::cmd("SET")
            .arg(format!("batch:{}", batch.id))
            .arg(&json)
            .arg("EX")
            .arg(86400u64)
            .exec_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let mut conn = self.conn().await?;
        let val: Option<String> = redis::cmd("GET")
            .arg(format!("batch:{id}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match val {
            Some(json) => {
                let rec: Batch = serde_json::from_str(&json).map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    async fn update_batch_status(
        &self,
        id: &str,
        status: BatchStatus,
        extra: BatchStatusUpdate,
    ) -> Result<(), StoreError> {
        let mut rec = self
            .get_batch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        rec.status = status;
        if let Some(v) = extra.submitted_at {
            rec.submitted_at = Some(v);
        }
        if let Some(v) = extra.confirmed_at {
            rec.confirmed_at = Some(v);
        }
        if let Some(v) = extra.anchor_signature {
            rec.anchor_signature = Some(v);
        }
        if let Some(v) = extra.error {
            rec.error = Some(v);
        }
        self.save_batch(&rec).await
    }
}

#[cfg(feature = "redis")]
impl IdempotencyStore for RedisStore {
    async fn check_and_set(&self, key: &str, result: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let redis_key = format!("idem:{key}");
        let was_set: bool = redis::cmd("SET")
            .arg(&redis_key)
            .arg(result)
            .arg("NX")
            .arg("EX")
            .arg(3600u64)
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        if was_set {
            Ok(None)
        } else {
            let existing: Option<String> = redis::cmd("GET")
                .arg(&redis_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(existing)
        }
    }
}

#[cfg(feature = "redis")]
impl RateLimitStore for RedisStore {
    async fn check_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let redis_key = format!("rl:{key}");
        let count: u32 = redis::cmd("INCR")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&redis_key)
            .arg(window_secs)
            .exec_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count <= limit)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds the appropriate store based on config. Returns an `InMemoryStore`;
/// when the `redis` feature is enabled and `config.redis_url` is set, the
/// caller constructs a `RedisStore` separately (trait objects with async fns
/// require boxing, so the concrete-type factory avoids that overhead).
pub fn build_store(config: &Config) -> Arc<InMemoryStore> {
    let _ = config;
    Arc::new(InMemoryStore::new())
}

#[cfg(feature = "redis")]
pub fn build_redis_store(url: &str) -> Result<Arc<RedisStore>, StoreError> {
    Ok(Arc::new(RedisStore::new(url)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;

    fn sample_tx() -> Transaction {
        Transaction {
            id: "tx-1".into(),
            sender: "a".into(),
            recipient: "b".into(),
            amount: 10,
            nonce: 1,
            expiry_timestamp: now_epoch() + 3600,
            kind: TransactionKind::Transfer,
            payload: Vec::new(),
            signature: Vec::new(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn transaction_lifecycle() {
        let store = InMemoryStore::new();
        let tx = sample_tx();
        store.save_transaction(&tx, TransactionStatus::Pending).await.unwrap();

        let fetched = store.get_transaction("tx-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, TransactionStatus::Pending);

        store
            .update_transaction_status("tx-1", TransactionStatus::Admitted, Some("batch-1".into()), None)
            .await
            .unwrap();
        let fetched = store.get_transaction("tx-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, TransactionStatus::Admitted);
        assert_eq!(fetched.batch_id.as_deref(), Some("batch-1"));
    }

    #[tokio::test]
    async fn batch_lifecycle() {
        let store = InMemoryStore::new();
        let batch = Batch {
            id: "batch-1".into(),
            merkle_root: [0u8; 32],
            tx_ids: vec!["tx-1".into()],
            status: BatchStatus::Pending,
            created_at: now_epoch(),
            submitted_at: None,
            confirmed_at: None,
            anchor_signature: None,
            error: None,
        };
        store.save_batch(&batch).await.unwrap();
        store
            .update_batch_status(
                "batch-1",
                BatchStatus::Confirmed,
                BatchStatusUpdate {
                    confirmed_at: Some(now_epoch()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fetched = store.get_batch("batch-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, BatchStatus::Confirmed);
        assert!(fetched.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn idempotency_dedups() {
        let store = InMemoryStore::new();
        let result = store.check_and_set("tx-abc", "batch-1").await.unwrap();
        assert!(result.is_none());
        let result = store.check_and_set("tx-abc", "batch-2").await.unwrap();
        assert_eq!(result.unwrap(), "batch-1");
    }

    #[tokio::test]
    async fn rate_limit_enforced() {
        let store = InMemoryStore::new();
        for _ in 0..3 {
            assert!(store.check_rate("key-1", 3, 60).await.unwrap());
        }
        assert!(!store.check_rate("key-1", 3, 60).await.unwrap());
    }

    #[tokio::test]
    async fn audit_events_grouped_by_kind() {
        let store = InMemoryStore::new();
        store
            .append_audit(&AuditEvent {
                id: "1".into(),
                kind: "RotationStarted".into(),
                payload_json: "{}".into(),
                created_at: now_epoch(),
            })
            .await
            .unwrap();
        let events = store.list_audit_by_kind("RotationStarted").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(store.list_audit_by_kind("Other").await.unwrap().is_empty());
    }
}
