//! Signing oracle with ordered primary -> secondary -> emergency failover.
//!
//! The original class hierarchy (abstract signer, HSM subclasses, software
//! fallback subclass) becomes a single tagged enum per the redesign note:
//! one call site matches on `ProviderVariant` instead of dispatching
//! through a vtable. Serialization-per-provider is grounded on the
//! teacher's per-resource `tokio::sync::Mutex` usage (e.g. `BatchQueue`'s
//! guarded `Vec`); each provider gets its own lock so a slow primary
//! doesn't block secondary/emergency traffic.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ed25519_dalek::{Signature as EdSignature, Signer as EdSigner, SigningKey as EdSigningKey, Verifier as EdVerifier, VerifyingKey as EdVerifyingKey};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey};
use rsa::signature::{SignatureEncoding, Signer as RsaSigner, Verifier as RsaVerifierTrait};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::telemetry::Telemetry;
use crate::types::{now_unix, AuditEvent, KeyAlgorithm, KeyRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    PrimaryHsm,
    SecondaryHsm,
    EmergencySoftware,
}

impl ProviderKind {
    fn index(self) -> u8 {
        match self {
            ProviderKind::PrimaryHsm => 0,
            ProviderKind::SecondaryHsm => 1,
            ProviderKind::EmergencySoftware => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialized,
    Initializing,
    Active,
    Unhealthy,
    Closed,
}

enum ProviderKey {
    Ed25519 { signing_key: EdSigningKey, key_id: String },
    Rsa {
        private_key: RsaPrivateKey,
        key_id: String,
        created_at: Instant,
        sig_count: u64,
    },
}

struct Provider {
    kind: ProviderKind,
    state: ProviderState,
    key: ProviderKey,
    consecutive_failures: u32,
}

pub struct EmergencyLimits {
    pub ttl: Duration,
    pub usage_cap: u64,
}

impl Default for EmergencyLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            usage_cap: 100,
        }
    }
}

/// Ordered primary/secondary/emergency chain. HSM providers are simulated
/// with in-process ed25519 keys — there is no real HSM line in this core,
/// only the failover contract around where one would sit.
pub struct SigningService {
    providers: Vec<Mutex<Provider>>,
    emergency_limits: EmergencyLimits,
    max_retries: u32,
    retry_base_delay: Duration,
    /// key_id -> (public key bytes, algorithm, valid_until). Populated by
    /// the rotation scheduler so old keys keep verifying during overlap.
    verification_registry: DashMap<String, (Vec<u8>, KeyAlgorithm, Option<Instant>)>,
    audit_log: Mutex<Vec<AuditEvent>>,
    current_provider: AtomicU8,
    emergency_mode: std::sync::atomic::AtomicBool,
    telemetry: Telemetry,
    /// Retired primary key from the most recent `rotate_primary` call,
    /// kept around so `rollback_primary` can restore it if the rotation
    /// turns out to leave no provider available. Cleared by `confirm_rotation`.
    pending_rollback: Mutex<Option<ProviderKey>>,
}

impl SigningService {
    pub fn new(emergency_limits: EmergencyLimits, max_retries: u32, retry_base_delay: Duration) -> Self {
        let primary = Provider {
            kind: ProviderKind::PrimaryHsm,
            state: ProviderState::Active,
            key: new_ed25519_key(),
            consecutive_failures: 0,
        };
        let secondary = Provider {
            kind: ProviderKind::SecondaryHsm,
            state: ProviderState::Active,
            key: new_ed25519_key(),
            consecutive_failures: 0,
        };
        let emergency = Provider {
            kind: ProviderKind::EmergencySoftware,
            state: ProviderState::Uninitialized,
            key: new_rsa_key(),
            consecutive_failures: 0,
        };

        let registry = DashMap::new();
        if let ProviderKey::Ed25519 { signing_key, key_id } = &primary.key {
            registry.insert(
                key_id.clone(),
                (signing_key.verifying_key().to_bytes().to_vec(), KeyAlgorithm::Ed25519, None),
            );
        }
        if let ProviderKey::Ed25519 { signing_key, key_id } = &secondary.key {
            registry.insert(
                key_id.clone(),
                (signing_key.verifying_key().to_bytes().to_vec(), KeyAlgorithm::Ed25519, None),
            );
        }

        Self {
            providers: vec![Mutex::new(primary), Mutex::new(secondary), Mutex::new(emergency)],
            emergency_limits,
            max_retries,
            retry_base_delay,
            verification_registry: registry,
            audit_log: Mutex::new(Vec::new()),
            current_provider: AtomicU8::new(0),
            emergency_mode: std::sync::atomic::AtomicBool::new(false),
            telemetry: Telemetry,
            pending_rollback: Mutex::new(None),
        }
    }

    /// Signs `message` with the lowest-index Active provider. A provider
    /// that fails is retried in place up to `max_retries` times with
    /// exponential backoff and jitter before being marked `Unhealthy` and
    /// handed off to the next provider down the chain; only returns
    /// `Fatal` once every provider has failed.
    pub async fn sign(&self, message: &[u8]) -> Result<(Vec<u8>, String), AppError> {
        for idx in 0..self.providers.len() {
            if let Some((sig, key_id, kind)) = self.sign_with_provider(idx, message).await {
                let promoted_from = self.current_provider.swap(kind.index(), Ordering::SeqCst);
                if promoted_from != kind.index() {
                    self.telemetry.record_failover();
                    self.telemetry.set_current_signing_provider(kind.index());
                }
                let emergency = kind == ProviderKind::EmergencySoftware;
                self.emergency_mode.store(emergency, Ordering::SeqCst);
                self.telemetry.set_emergency_mode(emergency);
                self.telemetry.record_signing_operation("success");
                return Ok((sig, key_id));
            }
        }
        Err(AppError::Fatal("all signing providers exhausted".into()))
    }

    /// Drives provider `idx` through up to `max_retries` attempts,
    /// sleeping `retry_base_delay * 2^attempt` (+-50% jitter) between them.
    /// Returns `None` (and marks the provider `Unhealthy`) once every
    /// attempt has failed or the provider isn't currently usable.
    async fn sign_with_provider(
        &self,
        idx: usize,
        message: &[u8],
    ) -> Option<(Vec<u8>, String, ProviderKind)> {
        let mut provider = self.providers[idx].lock().await;
        if provider.state != ProviderState::Active && provider.state != ProviderState::Uninitialized {
            return None;
        }
        if provider.state == ProviderState::Uninitialized {
            provider.state = ProviderState::Active;
            let kind = provider.kind;
            let fp = key_fingerprint(&provider.key);
            drop(provider);
            self.record_audit("Initialized", kind, fp).await;
            provider = self.providers[idx].lock().await;
        }

        if provider.kind == ProviderKind::EmergencySoftware {
            self.maybe_regenerate_emergency_key(&mut provider).await;
        }

        let kind = provider.kind;
        let attempts = self.max_retries.max(1);
        for attempt in 0..attempts {
            match self.try_sign_with(&mut provider, message).await {
                Ok((sig, key_id)) => {
                    provider.consecutive_failures = 0;
                    return Some((sig, key_id, kind));
                }
                Err(_) => {
                    provider.consecutive_failures += 1;
                    self.telemetry.record_signing_operation("failure");
                    if attempt + 1 >= attempts {
                        break;
                    }
                    let delay = backoff_with_jitter(self.retry_base_delay, attempt);
                    drop(provider);
                    tokio::time::sleep(delay).await;
                    provider = self.providers[idx].lock().await;
                }
            }
        }

        provider.state = ProviderState::Unhealthy;
        let fp = key_fingerprint(&provider.key);
        drop(provider);
        self.record_audit("FailedOver", kind, fp).await;
        warn!(provider = ?kind, "signing provider marked unhealthy");
        None
    }

    async fn try_sign_with(&self, provider: &mut Provider, message: &[u8]) -> Result<(Vec<u8>, String), ()> {
        match &provider.key {
            ProviderKey::Ed25519 { signing_key, key_id } => {
                let sig: EdSignature = signing_key.sign(message);
                Ok((sig.to_bytes().to_vec(), key_id.clone()))
            }
            ProviderKey::Rsa { private_key, key_id, .. } => {
                let signing_key: RsaSigningKey<Sha256> = RsaSigningKey::new(private_key.clone());
                let sig = signing_key.try_sign(message).map_err(|_| ())?;
                if let ProviderKey::Rsa { sig_count, .. } = &mut provider.key {
                    *sig_count += 1;
                }
                Ok((sig.to_vec(), key_id.clone()))
            }
        }
    }

    async fn maybe_regenerate_emergency_key(&self, provider: &mut Provider) {
        let should_regenerate = match &provider.key {
            ProviderKey::Rsa { created_at, sig_count, .. } => {
                created_at.elapsed() >= self.emergency_limits.ttl
                    || *sig_count >= self.emergency_limits.usage_cap
            }
            _ => false,
        };
        if should_regenerate {
            provider.key = new_rsa_key();
            provider.consecutive_failures = 0;
            let fp = key_fingerprint(&provider.key);
            self.record_audit("EmergencyKeyRegenerated", provider.kind, fp).await;
        }
    }

    /// Verifies against either the provider's current key or any key still
    /// inside its rotation overlap window.
    pub fn verify(&self, message: &[u8], signature: &[u8], key_id: &str) -> bool {
        let Some(entry) = self.verification_registry.get(key_id) else {
            return false;
        };
        let (pubkey_bytes, algorithm, valid_until) = &*entry;
        if let Some(until) = valid_until {
            if Instant::now() > *until {
                return false;
            }
        }
        match algorithm {
            KeyAlgorithm::Ed25519 => {
                let Ok(bytes) = <[u8; 32]>::try_from(pubkey_bytes.as_slice()) else {
                    return false;
                };
                let Ok(vk) = EdVerifyingKey::from_bytes(&bytes) else {
                    return false;
                };
                let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
                    return false;
                };
                vk.verify(message, &EdSignature::from_bytes(&sig_bytes)).is_ok()
            }
            KeyAlgorithm::Rsa2048 => {
                use rsa::pkcs1::DecodeRsaPublicKey;
                let Ok(pk) = RsaPublicKey::from_pkcs1_der(pubkey_bytes) else {
                    return false;
                };
                let vk: RsaVerifyingKey<Sha256> = RsaVerifyingKey::new(pk);
                let Ok(sig) = RsaSignature::try_from(signature) else {
                    return false;
                };
                vk.verify(message, &sig).is_ok()
            }
        }
    }

    pub async fn public_key(&self, kind: ProviderKind) -> Option<Vec<u8>> {
        let provider = self.providers[kind.index() as usize].lock().await;
        match &provider.key {
            ProviderKey::Ed25519 { signing_key, .. } => Some(signing_key.verifying_key().to_bytes().to_vec()),
            ProviderKey::Rsa { private_key, .. } => {
                use rsa::pkcs1::EncodeRsaPublicKey;
                RsaPublicKey::from(private_key).to_pkcs1_der().ok().map(|d| d.as_bytes().to_vec())
            }
        }
    }

    pub async fn available(&self) -> bool {
        for p in &self.providers {
            let guard = p.lock().await;
            if guard.state == ProviderState::Active {
                return true;
            }
        }
        false
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::SeqCst)
    }

    pub fn register_verification_key(
        &self,
        key_id: String,
        pubkey_bytes: Vec<u8>,
        algorithm: KeyAlgorithm,
        valid_until: Option<Instant>,
    ) {
        self.verification_registry.insert(key_id, (pubkey_bytes, algorithm, valid_until));
    }

    /// Narrows an already-registered key's validity window without
    /// touching its public key material — used when a rotated-out key
    /// enters its overlap window.
    pub fn set_key_overlap_deadline(&self, key_id: &str, until: Instant) {
        if let Some(mut entry) = self.verification_registry.get_mut(key_id) {
            entry.2 = Some(until);
        }
    }

    /// Replaces the primary provider's signing key, e.g. as part of
    /// rotation. Returns the new key's id and the retired key's id. The
    /// retired key is kept until `confirm_rotation` or `rollback_primary`
    /// is called, so a failed rotation can be undone.
    pub async fn rotate_primary(&self) -> (String, String) {
        let mut provider = self.providers[ProviderKind::PrimaryHsm.index() as usize]
            .lock()
            .await;
        let old_key_id = match &provider.key {
            ProviderKey::Ed25519 { key_id, .. } => key_id.clone(),
            ProviderKey::Rsa { key_id, .. } => key_id.clone(),
        };
        let old_key = std::mem::replace(&mut provider.key, new_ed25519_key());
        let new_key_id = if let ProviderKey::Ed25519 { signing_key, key_id } = &provider.key {
            self.verification_registry.insert(
                key_id.clone(),
                (signing_key.verifying_key().to_bytes().to_vec(), KeyAlgorithm::Ed25519, None),
            );
            key_id.clone()
        } else {
            unreachable!("newly generated primary key is always ed25519")
        };
        drop(provider);
        *self.pending_rollback.lock().await = Some(old_key);
        (new_key_id, old_key_id)
    }

    /// Discards the rollback point from the last `rotate_primary` call,
    /// making the rotation permanent.
    pub async fn confirm_rotation(&self) {
        *self.pending_rollback.lock().await = None;
    }

    /// Restores the primary provider to the key it held before the most
    /// recent `rotate_primary` call. No-op (returns `false`) if there is
    /// no pending rotation to undo.
    pub async fn rollback_primary(&self) -> bool {
        let Some(old_key) = self.pending_rollback.lock().await.take() else {
            return false;
        };
        let mut provider = self.providers[ProviderKind::PrimaryHsm.index() as usize]
            .lock()
            .await;
        provider.key = old_key;
        provider.state = ProviderState::Active;
        provider.consecutive_failures = 0;
        let kind = provider.kind;
        let fp = key_fingerprint(&provider.key);
        drop(provider);
        self.record_audit("RotationRolledBack", kind, fp).await;
        true
    }

    /// Periodic health probe: real HSM backends would ping hardware here.
    /// This in-process simulation promotes any `Unhealthy` provider back
    /// to `Active` once its failure streak has been reset by an operator
    /// action or enough time has passed.
    pub fn spawn_health_probe(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                for p in &self.providers {
                    let mut guard = p.lock().await;
                    if guard.state == ProviderState::Unhealthy && guard.consecutive_failures == 0 {
                        guard.state = ProviderState::Active;
                        let kind = guard.kind;
                        let fp = key_fingerprint(&guard.key);
                        drop(guard);
                        self.record_audit("Recovered", kind, fp).await;
                        info!(provider = ?kind, "signing provider recovered");
                    }
                }
            }
        });
    }

    async fn record_audit(&self, kind: &'static str, provider: ProviderKind, key_fingerprint: String) {
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload_json: format!(
                "{{\"provider\":\"{:?}\",\"key_fingerprint\":\"{}\"}}",
                provider, key_fingerprint
            ),
            created_at: now_unix(),
        };
        self.audit_log.lock().await.push(event);
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit_log.lock().await.clone()
    }
}

fn new_ed25519_key() -> ProviderKey {
    let signing_key = EdSigningKey::generate(&mut OsRng);
    ProviderKey::Ed25519 {
        signing_key,
        key_id: Uuid::new_v4().to_string(),
    }
}

fn new_rsa_key() -> ProviderKey {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("rsa key generation");
    ProviderKey::Rsa {
        private_key,
        key_id: Uuid::new_v4().to_string(),
        created_at: Instant::now(),
        sig_count: 0,
    }
}

/// `base * 2^attempt`, jittered by +-50% so a batch of callers retrying a
/// flaky provider together don't all wake up and retry in lockstep.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter = 0.5 + rand::random::<f64>();
    Duration::from_secs_f64(exp.as_secs_f64() * jitter)
}

fn key_fingerprint(key: &ProviderKey) -> String {
    match key {
        ProviderKey::Ed25519 { key_id, .. } => key_id.clone(),
        ProviderKey::Rsa { key_id, .. } => key_id.clone(),
    }
}

pub fn key_record_for(kind: ProviderKind, key_id: String, algorithm: KeyAlgorithm, active: bool) -> KeyRecord {
    let _ = kind;
    KeyRecord {
        key_id,
        algorithm,
        created_at: now_unix(),
        active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_with_primary_by_default() {
        let service = SigningService::new(EmergencyLimits::default(), 3, Duration::from_millis(1));
        let (sig, key_id) = service.sign(b"root").await.unwrap();
        assert!(service.verify(b"root", &sig, &key_id));
    }

    #[tokio::test]
    async fn rollback_primary_restores_previous_key_after_failed_rotation() {
        let service = SigningService::new(EmergencyLimits::default(), 3, Duration::from_millis(1));
        let original_pubkey = service.public_key(ProviderKind::PrimaryHsm).await.unwrap();

        service.rotate_primary().await;
        let rotated_pubkey = service.public_key(ProviderKind::PrimaryHsm).await.unwrap();
        assert_ne!(original_pubkey, rotated_pubkey);

        assert!(service.rollback_primary().await);
        let restored_pubkey = service.public_key(ProviderKind::PrimaryHsm).await.unwrap();
        assert_eq!(original_pubkey, restored_pubkey);

        // the rollback point is consumed by the first call
        assert!(!service.rollback_primary().await);
    }

    #[tokio::test]
    async fn confirm_rotation_clears_the_rollback_point() {
        let service = SigningService::new(EmergencyLimits::default(), 3, Duration::from_millis(1));
        service.rotate_primary().await;
        service.confirm_rotation().await;
        assert!(!service.rollback_primary().await);
    }

    #[tokio::test]
    async fn rotation_keeps_old_key_verifiable() {
        let service = SigningService::new(EmergencyLimits::default(), 3, Duration::from_millis(1));
        let (old_sig, old_key_id) = service.sign(b"before rotation").await.unwrap();
        let (_new_key_id, retired) = service.rotate_primary().await;
        assert_eq!(retired, old_key_id);
        // old key is still registered (overlap window not yet expired)
        assert!(service.verify(b"before rotation", &old_sig, &old_key_id));
    }

    #[test]
    fn backoff_with_jitter_stays_within_plus_minus_half() {
        let base = Duration::from_secs(1);
        for attempt in 0..4 {
            let delay = backoff_with_jitter(base, attempt);
            let expected = base.as_secs_f64() * 2f64.powi(attempt as i32);
            assert!(delay.as_secs_f64() >= expected * 0.5);
            assert!(delay.as_secs_f64() <= expected * 1.5);
        }
    }

    #[tokio::test]
    async fn failover_demotes_unhealthy_primary() {
        let service = SigningService::new(EmergencyLimits::default(), 1, Duration::from_millis(1));
        {
            let mut primary = service.providers[0].lock().await;
            primary.state = ProviderState::Unhealthy;
        }
        let (_, key_id) = service.sign(b"root").await.unwrap();
        let secondary = service.providers[1].lock().await;
        if let ProviderKey::Ed25519 { key_id: expected, .. } = &secondary.key {
            assert_eq!(&key_id, expected);
        } else {
            panic!("expected secondary to hold an ed25519 key");
        }
    }
}
