//! Per-transaction admission checks: structural, signature, nonce,
//! balance, rate limit — run in that order so the cheapest checks reject
//! first.
//!
//! Nonce cache and rate-limit tables are sharded by key space (16 shards
//! by default), generalizing the teacher's `RateLimitStore`/`InMemoryStore`
//! sharded-map shape from a Redis-backed design to purely in-process
//! locks, since both caches are hot-path and never need durability.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tokio::sync::Mutex;

use crate::account_state::AccountState;
use crate::error::AppError;
use crate::types::{now_unix, Transaction, TransactionKind};

const DEFAULT_SHARD_COUNT: usize = 16;

fn shard_index(key: &str, shard_count: usize) -> usize {
    let mut acc: u64 = 1469598103934665603;
    for b in key.as_bytes() {
        acc ^= *b as u64;
        acc = acc.wrapping_mul(1099511628211);
    }
    (acc as usize) % shard_count
}

/// Bounded-TTL replay cache for `(sender, nonce)` pairs, sharded so a hot
/// sender doesn't serialize every other sender's admission.
struct NonceCache {
    shards: Vec<Mutex<HashMap<(String, u64), Instant>>>,
    ttl: Duration,
}

impl NonceCache {
    fn new(shard_count: usize, ttl: Duration) -> Self {
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
        }
    }

    /// Returns `true` if `(sender, nonce)` was already seen (within TTL),
    /// otherwise records it and returns `false`.
    async fn check_and_insert(&self, sender: &str, nonce: u64) -> bool {
        let idx = shard_index(sender, self.shards.len());
        let mut shard = self.shards[idx].lock().await;
        let now = Instant::now();
        shard.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        let key = (sender.to_string(), nonce);
        if shard.contains_key(&key) {
            return true;
        }
        shard.insert(key, now);
        false
    }
}

/// Sliding-window limiter, per-sender sharded plus one global counter.
struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, VecDeque<Instant>>>>,
    per_sender_limit: u32,
    global_count: AtomicU64,
    global_window_start: Mutex<Instant>,
    global_limit: u64,
}

impl RateLimiter {
    fn new(shard_count: usize, per_sender_limit: u32, global_limit: u64) -> Self {
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            per_sender_limit,
            global_count: AtomicU64::new(0),
            global_window_start: Mutex::new(Instant::now()),
            global_limit,
        }
    }

    async fn allow(&self, sender: &str) -> bool {
        if !self.allow_global().await {
            return false;
        }
        let idx = shard_index(sender, self.shards.len());
        let mut shard = self.shards[idx].lock().await;
        let now = Instant::now();
        let window = shard.entry(sender.to_string()).or_insert_with(VecDeque::new);
        while matches!(window.front(), Some(t) if now.duration_since(*t) >= Duration::from_secs(1)) {
            window.pop_front();
        }
        if window.len() as u32 >= self.per_sender_limit {
            return false;
        }
        window.push_back(now);
        true
    }

    async fn allow_global(&self) -> bool {
        let mut start = self.global_window_start.lock().await;
        let now = Instant::now();
        if now.duration_since(*start) >= Duration::from_secs(1) {
            *start = now;
            self.global_count.store(0, Ordering::SeqCst);
        }
        let prev = self.global_count.fetch_add(1, Ordering::SeqCst);
        prev < self.global_limit
    }
}

pub struct Validator {
    nonce_cache: NonceCache,
    rate_limiter: RateLimiter,
    account_state: Arc<AccountState>,
}

impl Validator {
    pub fn new(
        account_state: Arc<AccountState>,
        nonce_ttl: Duration,
        per_sender_limit: u32,
        global_limit: u64,
    ) -> Self {
        Self {
            nonce_cache: NonceCache::new(DEFAULT_SHARD_COUNT, nonce_ttl),
            rate_limiter: RateLimiter::new(DEFAULT_SHARD_COUNT, per_sender_limit, global_limit),
            account_state,
        }
    }

    pub async fn validate(&self, tx: &Transaction) -> Result<(), AppError> {
        self.validate_structural(tx)?;
        self.validate_signature(tx)?;
        self.validate_nonce(tx).await?;
        self.validate_balance(tx)?;
        self.validate_rate_limit(tx).await?;
        Ok(())
    }

    fn validate_structural(&self, tx: &Transaction) -> Result<(), AppError> {
        if tx.id.is_empty() || tx.sender.is_empty() || tx.recipient.is_empty() {
            return Err(AppError::InvalidInput("missing required field".into()));
        }
        if tx.expiry_timestamp <= now_unix() {
            return Err(AppError::Expired);
        }
        Ok(())
    }

    /// The sender address is the hex-encoded ed25519 verifying key: this
    /// core does not maintain a separate key-registry table.
    fn validate_signature(&self, tx: &Transaction) -> Result<(), AppError> {
        let pubkey_bytes = hex::decode(&tx.sender)
            .map_err(|_| AppError::InvalidInput("sender is not a valid hex public key".into()))?;
        let pubkey_bytes: [u8; 32] = pubkey_bytes
            .try_into()
            .map_err(|_| AppError::InvalidInput("sender public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&pubkey_bytes)
            .map_err(|_| AppError::AuthFailure)?;
        let sig_bytes: [u8; 64] = tx
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| AppError::InvalidInput("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(&tx.canonical_bytes(), &signature)
            .map_err(|_| AppError::AuthFailure)
    }

    async fn validate_nonce(&self, tx: &Transaction) -> Result<(), AppError> {
        if self.nonce_cache.check_and_insert(&tx.sender, tx.nonce).await {
            return Err(AppError::NonceReplay);
        }
        let account = self.account_state.get(&tx.sender);
        if tx.nonce != account.nonce + 1 {
            return Err(AppError::NonceReplay);
        }
        Ok(())
    }

    fn validate_balance(&self, tx: &Transaction) -> Result<(), AppError> {
        if matches!(tx.kind, TransactionKind::Transfer | TransactionKind::Withdrawal) {
            let account = self.account_state.get(&tx.sender);
            if account.balance < tx.amount {
                return Err(AppError::InsufficientBalance);
            }
        }
        Ok(())
    }

    async fn validate_rate_limit(&self, tx: &Transaction) -> Result<(), AppError> {
        if !self.rate_limiter.allow(&tx.sender).await {
            return Err(AppError::RateLimited);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn signed_tx(signing_key: &SigningKey, nonce: u64) -> Transaction {
        let sender = hex::encode(signing_key.verifying_key().to_bytes());
        let mut tx = Transaction {
            id: format!("tx-{nonce}"),
            sender,
            recipient: "recipient".into(),
            amount: 5,
            nonce,
            expiry_timestamp: now_unix() + 3600,
            kind: TransactionKind::Transfer,
            payload: Vec::new(),
            signature: Vec::new(),
            priority: 0,
        };
        let sig = signing_key.sign(&tx.canonical_bytes());
        tx.signature = sig.to_bytes().to_vec();
        tx
    }

    #[tokio::test]
    async fn valid_transaction_is_accepted() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let state = Arc::new(AccountState::new());
        let tx = signed_tx(&signing_key, 1);
        state.credit(&tx.sender, 100);
        let validator = Validator::new(state, Duration::from_secs(600), 100, 5000);
        assert!(validator.validate(&tx).await.is_ok());
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let state = Arc::new(AccountState::new());
        let tx = signed_tx(&signing_key, 1);
        state.credit(&tx.sender, 100);
        let validator = Validator::new(state, Duration::from_secs(600), 100, 5000);
        assert!(validator.validate(&tx).await.is_ok());
        let err = validator.validate(&tx).await.unwrap_err();
        assert!(matches!(err, AppError::NonceReplay));
    }

    #[tokio::test]
    async fn tampered_signature_fails_auth() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let state = Arc::new(AccountState::new());
        let mut tx = signed_tx(&signing_key, 1);
        tx.amount = 999;
        state.credit(&tx.sender, 1000);
        let validator = Validator::new(state, Duration::from_secs(600), 100, 5000);
        let err = validator.validate(&tx).await.unwrap_err();
        assert!(matches!(err, AppError::AuthFailure));
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let state = Arc::new(AccountState::new());
        let tx = signed_tx(&signing_key, 1);
        state.credit(&tx.sender, 1);
        let validator = Validator::new(state, Duration::from_secs(600), 100, 5000);
        let err = validator.validate(&tx).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance));
    }

    #[tokio::test]
    async fn per_sender_rate_limit_triggers() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let state = Arc::new(AccountState::new());
        state.credit(&hex::encode(signing_key.verifying_key().to_bytes()), 10_000);
        let validator = Validator::new(state, Duration::from_secs(600), 2, 5000);
        for n in 1..=2u64 {
            let tx = signed_tx(&signing_key, n);
            assert!(validator.validate(&tx).await.is_ok());
        }
        let tx = signed_tx(&signing_key, 3);
        let err = validator.validate(&tx).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited));
    }
}
