//! Tracks the primary key's age and triggers rotation with an overlap
//! window. Holds `SigningService` by `Arc`, not an owning pointer — the
//! hub-and-spoke shape the redesign notes call for, so the scheduler never
//! becomes part of a signing-service <-> scheduler ownership cycle.
//!
//! Grounded on the teacher's `spawn_timeout_loop` (a `tokio::time::interval`
//! tick driving a guarded check-then-act sequence).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};
use uuid::Uuid;

use crate::signing::SigningService;
use crate::types::{now_unix, AuditEvent};

pub struct KeyRotationScheduler {
    signing_service: Arc<SigningService>,
    check_interval: Duration,
    rotation_interval: Duration,
    overlap: Duration,
    last_rotation: AtomicU64,
    events: tokio::sync::Mutex<Vec<AuditEvent>>,
}

impl KeyRotationScheduler {
    pub fn new(
        signing_service: Arc<SigningService>,
        check_interval: Duration,
        rotation_interval: Duration,
        overlap: Duration,
    ) -> Self {
        Self {
            signing_service,
            check_interval,
            rotation_interval,
            overlap,
            last_rotation: AtomicU64::new(now_unix()),
            events: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.check_interval);
            loop {
                tick.tick().await;
                self.check_and_rotate().await;
            }
        });
    }

    async fn check_and_rotate(&self) {
        let last = self.last_rotation.load(Ordering::SeqCst);
        let elapsed = now_unix().saturating_sub(last);
        if elapsed < self.rotation_interval.as_secs() {
            return;
        }

        self.emit("RotationStarted").await;
        info!("key rotation starting");

        let overlap_until = Instant::now() + self.overlap;
        let (new_key_id, old_key_id) = self.signing_service.rotate_primary().await;
        self.signing_service.set_key_overlap_deadline(&old_key_id, overlap_until);

        match self.signing_service.available().await {
            true => {
                self.signing_service.confirm_rotation().await;
                self.last_rotation.store(now_unix(), Ordering::SeqCst);
                self.emit("RotationCompleted").await;
                info!(new_key_id, old_key_id, "key rotation completed");
            }
            false => {
                self.signing_service.rollback_primary().await;
                error!(old_key_id, "rotation left no provider available, rolled back to previous key");
                self.emit("RotationError").await;
            }
        }
    }

    async fn emit(&self, kind: &'static str) {
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload_json: "{}".to_string(),
            created_at: now_unix(),
        };
        self.events.lock().await.push(event);
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::EmergencyLimits;

    #[tokio::test]
    async fn rotation_emits_started_and_completed() {
        let signing = Arc::new(SigningService::new(
            EmergencyLimits::default(),
            3,
            Duration::from_millis(1),
        ));
        let scheduler = Arc::new(KeyRotationScheduler::new(
            signing,
            Duration::from_millis(10),
            Duration::from_secs(0),
            Duration::from_secs(60 * 60 * 24),
        ));
        scheduler.check_and_rotate().await;
        let events = scheduler.events().await;
        assert_eq!(events[0].kind, "RotationStarted");
        assert_eq!(events[1].kind, "RotationCompleted");
    }

    #[tokio::test]
    async fn rotation_skipped_before_interval_elapses() {
        let signing = Arc::new(SigningService::new(
            EmergencyLimits::default(),
            3,
            Duration::from_millis(1),
        ));
        let scheduler = KeyRotationScheduler::new(
            signing,
            Duration::from_millis(10),
            Duration::from_secs(60 * 60 * 24 * 90),
            Duration::from_secs(60 * 60 * 24),
        );
        scheduler.check_and_rotate().await;
        assert!(scheduler.events().await.is_empty());
    }
}
