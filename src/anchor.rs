//! Outbound anchor sink contract. The on-chain program itself is out of
//! scope; this module only owns the retry/idempotency shape a caller
//! needs around it, grounded on `bridge.rs`'s `bridge_withdrawal`
//! (exponential backoff, `AlreadyBridged` short-circuit) but abstracted
//! behind a trait instead of shelling out to a fixed CLI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::reconciler::{AnchorView, RepairError, Repairer};
use crate::sequencer::Sequencer;
use crate::store::{AuditStore, InMemoryStore};
use crate::types::{now_unix, AuditEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    Rejected(String),
    Transient(String),
}

impl std::fmt::Display for AnchorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorError::Rejected(msg) => write!(f, "anchor rejected: {msg}"),
            AnchorError::Transient(msg) => write!(f, "anchor transient failure: {msg}"),
        }
    }
}

impl std::error::Error for AnchorError {}

#[derive(Debug, Clone)]
pub struct AnchorMetadata {
    pub tx_count: usize,
    pub batch_created_at: u64,
}

/// Submission must be idempotent on `batch_id`: submitting the same batch
/// twice is a no-op success, not a duplicate commitment.
pub trait AnchorSink: Send + Sync {
    fn submit_anchor(
        &self,
        batch_id: &str,
        merkle_root: [u8; 32],
        signature: &[u8],
        metadata: &AnchorMetadata,
    ) -> impl std::future::Future<Output = Result<(), AnchorError>> + Send;
}

/// In-process stand-in for the real anchor RPC — keeps committed batch
/// roots so `submit_anchor` is idempotent without depending on chain state,
/// and so the reconciler has something to diff the local view against.
pub struct InProcessAnchorSink {
    committed: Mutex<HashMap<String, [u8; 32]>>,
}

impl Default for InProcessAnchorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessAnchorSink {
    pub fn new() -> Self {
        Self {
            committed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_committed(&self, batch_id: &str) -> bool {
        self.committed.lock().await.contains_key(batch_id)
    }
}

impl AnchorSink for InProcessAnchorSink {
    async fn submit_anchor(
        &self,
        batch_id: &str,
        merkle_root: [u8; 32],
        _signature: &[u8],
        _metadata: &AnchorMetadata,
    ) -> Result<(), AnchorError> {
        let mut committed = self.committed.lock().await;
        committed.insert(batch_id.to_string(), merkle_root);
        Ok(())
    }
}

impl AnchorView for InProcessAnchorSink {
    async fn snapshot(&self) -> HashMap<String, [u8; 32]> {
        self.committed.lock().await.clone()
    }
}

/// Drives the three discrepancy-class repairs by treating the sequencer's
/// confirmed batches as ground truth and replaying them at the anchor.
/// Grounded on `bridge.rs::bridge_withdrawal`'s same retry-then-record
/// shape, generalized from a single withdrawal path to the reconciler's
/// three repair verbs.
pub struct SequencerRepairer<S: AnchorSink> {
    sequencer: Arc<Sequencer<S>>,
    anchor_sink: Arc<S>,
    store: Arc<InMemoryStore>,
}

impl<S: AnchorSink + 'static> SequencerRepairer<S> {
    pub fn new(sequencer: Arc<Sequencer<S>>, anchor_sink: Arc<S>, store: Arc<InMemoryStore>) -> Self {
        Self { sequencer, anchor_sink, store }
    }

    async fn resubmit_local_batch(&self, batch_id: &str) -> Result<(), RepairError> {
        let batch = self
            .sequencer
            .batches
            .get(batch_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepairError::Transient(format!("no local batch for {batch_id}")))?;
        let signature = batch.anchor_signature.clone().unwrap_or_default();
        let metadata = AnchorMetadata {
            tx_count: batch.tx_ids.len(),
            batch_created_at: batch.created_at,
        };
        self.anchor_sink
            .submit_anchor(batch_id, batch.merkle_root, &signature, &metadata)
            .await
            .map_err(|err| RepairError::Transient(err.to_string()))
    }
}

impl<S: AnchorSink + 'static> Repairer for SequencerRepairer<S> {
    async fn resubmit(&self, id: &str) -> Result<(), RepairError> {
        self.resubmit_local_batch(id).await
    }

    /// Anchor holds a batch this core never produced locally (a restart
    /// against a stale snapshot, most likely). There is nothing to
    /// materialize, so the event is recorded and the discrepancy is
    /// considered handled rather than retried forever.
    async fn ingest(&self, id: &str) -> Result<(), RepairError> {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: "orphan_anchor_batch".to_string(),
            payload_json: format!("{{\"batch_id\":\"{id}\"}}"),
            created_at: now_unix(),
        };
        self.store
            .append_audit(&event)
            .await
            .map_err(|err| RepairError::Transient(err.to_string()))
    }

    async fn reconcile(&self, id: &str) -> Result<(), RepairError> {
        self.resubmit_local_batch(id).await
    }
}

/// Calls `sink.submit_anchor` with exponential backoff, up to
/// `max_retries`. Only `Transient` failures are retried; `Rejected` is
/// returned immediately.
pub async fn submit_with_retry<S: AnchorSink>(
    sink: &S,
    batch_id: &str,
    merkle_root: [u8; 32],
    signature: &[u8],
    metadata: &AnchorMetadata,
    max_retries: u32,
    base_delay: Duration,
) -> Result<(), AnchorError> {
    for attempt in 0..=max_retries {
        match sink.submit_anchor(batch_id, merkle_root, signature, metadata).await {
            Ok(()) => return Ok(()),
            Err(AnchorError::Rejected(msg)) => return Err(AnchorError::Rejected(msg)),
            Err(err @ AnchorError::Transient(_)) if attempt < max_retries => {
                let backoff = base_delay * 2u32.pow(attempt);
                warn!(batch_id, attempt, ?backoff, error = %err, "anchor submission failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop always returns before exceeding max_retries")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_is_idempotent_on_batch_id() {
        let sink = InProcessAnchorSink::new();
        let metadata = AnchorMetadata { tx_count: 1, batch_created_at: 0 };
        sink.submit_anchor("batch-1", [0u8; 32], &[], &metadata).await.unwrap();
        sink.submit_anchor("batch-1", [0u8; 32], &[], &metadata).await.unwrap();
        assert!(sink.is_committed("batch-1").await);
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_rejection() {
        struct AlwaysRejects;
        impl AnchorSink for AlwaysRejects {
            async fn submit_anchor(
                &self,
                _: &str,
                _: [u8; 32],
                _: &[u8],
                _: &AnchorMetadata,
            ) -> Result<(), AnchorError> {
                Err(AnchorError::Rejected("bad signature".into()))
            }
        }
        let metadata = AnchorMetadata { tx_count: 1, batch_created_at: 0 };
        let result = submit_with_retry(
            &AlwaysRejects,
            "b",
            [0u8; 32],
            &[],
            &metadata,
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(AnchorError::Rejected(_))));
    }
}
