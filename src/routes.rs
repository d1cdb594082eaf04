//! Transaction admission surface: `/health`, `/status`, `/submit`,
//! `/submit_batch`, `/status/{id}`, `/proof/{tx_id}`. Grounded on the
//! teacher's axum wiring — `AppState` behind `Arc`, `require_auth` +
//! per-key/per-IP rate limiting ahead of the handler body, sanitized
//! `AppError` responses — generalized from the privacy-specific submission
//! envelope to the plain transaction admission surface.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::anchor::InProcessAnchorSink;
use crate::config::Config;
use crate::error::AppError;
use crate::sequencer::Sequencer;
use crate::signing::SigningService;
use crate::store::{IdempotencyStore, InMemoryStore, RateLimitStore, TransactionStore};
use crate::types::{Transaction, TransactionKind, TransactionStatus};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub sequencer: Arc<Sequencer<InProcessAnchorSink>>,
    pub ring_queue: Arc<crate::ring_queue::RingQueue<Transaction>>,
    pub store: Arc<InMemoryStore>,
    pub signing: Arc<SigningService>,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// JSON request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub nonce: u64,
    pub expiry_timestamp: u64,
    pub kind: TransactionKind,
    /// Hex-encoded opaque payload bytes.
    #[serde(default)]
    pub payload: String,
    /// Hex-encoded signature over `Transaction::canonical_bytes()`.
    pub signature: String,
    /// Admission priority tier, higher is more urgent. Not signed over.
    #[serde(default)]
    pub priority: u8,
}

impl SubmitRequest {
    pub fn into_transaction(self) -> Result<Transaction, AppError> {
        if self.id.is_empty() || self.id.len() > 128 {
            return Err(AppError::InvalidInput("id must be 1-128 chars".into()));
        }
        let payload = hex::decode(&self.payload)
            .map_err(|_| AppError::InvalidInput("payload must be hex".into()))?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| AppError::InvalidInput("signature must be hex".into()))?;
        Ok(Transaction {
            id: self.id,
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            nonce: self.nonce,
            expiry_timestamp: self.expiry_timestamp,
            kind: self.kind,
            payload,
            signature,
            priority: self.priority,
        })
    }

    /// Deterministic idempotency key derived from the submitted transaction id.
    pub fn idempotency_key(&self) -> String {
        format!("submit:{}", self.id)
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitBatchRequest {
    pub transactions: Vec<SubmitRequest>,
}

// ---------------------------------------------------------------------------
// Middleware: API key extraction
// ---------------------------------------------------------------------------

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(String::from)
        })
}

pub fn require_auth(headers: &HeaderMap, config: &Config) -> Result<String, AppError> {
    let key = extract_api_key(headers).ok_or(AppError::AuthFailure)?;
    if !config.is_api_key_valid(&key) {
        return Err(AppError::AuthFailure);
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "sequencer-core",
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue_size = state.ring_queue.size().await;
    Json(json!({
        "queue_size": queue_size,
        "batch_size": state.config.batch_size,
        "batch_window_ms": state.config.batch_window_ms,
        "emergency_mode": state.signing.is_emergency_mode(),
    }))
}

/// Under emergency mode the signing path runs on the software fallback key,
/// so admission is throttled to a fraction of the normal budget rather than
/// waiting for a provider to fail outright.
const EMERGENCY_RATE_DIVISOR: u32 = 4;

async fn rate_limit_guard(
    state: &AppState,
    api_key: &str,
    client_ip: &str,
) -> Result<(), AppError> {
    let divisor = if state.signing.is_emergency_mode() { EMERGENCY_RATE_DIVISOR } else { 1 };

    let per_key = state
        .store
        .check_rate(
            &format!("key:{api_key}"),
            (state.config.rate_limit_per_sender_per_sec * 60 / divisor).max(1),
            60,
        )
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !per_key {
        return Err(AppError::RateLimited);
    }

    let per_ip = state
        .store
        .check_rate(
            &format!("ip:{client_ip}"),
            (state.config.max_transactions_per_second * 60 / divisor).max(1),
            60,
        )
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !per_ip {
        return Err(AppError::RateLimited);
    }
    Ok(())
}

fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

/// Submits a single transaction: `{accepted, id}` on success, else a
/// sanitized rejection carrying the error code.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let api_key = require_auth(&headers, &state.config)?;
    let ip = client_ip(&headers, Some(addr));
    rate_limit_guard(&state, &api_key, &ip).await?;

    let idem_key = body.idempotency_key();
    if let Some(cached) = state
        .store
        .check_and_set(&idem_key, "submitted")
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
    {
        return Ok((
            StatusCode::OK,
            Json(json!({ "status": "duplicate", "cached_result": cached })),
        ));
    }

    let tx = body.into_transaction()?;
    let tx_id = tx.id.clone();

    state
        .store
        .save_transaction(&tx, TransactionStatus::Pending)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    state
        .ring_queue
        .enqueue(tx)
        .await
        .map_err(|_| AppError::Fatal("admission surface closed".into()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "id": tx_id })),
    ))
}

/// Submits many transactions, returning a per-transaction result in the
/// same order as the request — one rejection never blocks the rest.
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SubmitBatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let api_key = require_auth(&headers, &state.config)?;
    let ip = client_ip(&headers, Some(addr));
    rate_limit_guard(&state, &api_key, &ip).await?;

    let mut results = Vec::with_capacity(body.transactions.len());
    for req in body.transactions {
        let idem_key = req.idempotency_key();
        let already_seen = state
            .store
            .check_and_set(&idem_key, "submitted")
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        if already_seen.is_some() {
            results.push(json!({ "id": req.id, "status": "duplicate" }));
            continue;
        }

        match req.into_transaction() {
            Ok(tx) => {
                let tx_id = tx.id.clone();
                let _ = state.store.save_transaction(&tx, TransactionStatus::Pending).await;
                match state.ring_queue.enqueue(tx).await {
                    Ok(()) => results.push(json!({ "id": tx_id, "accepted": true })),
                    Err(_) => results.push(json!({ "id": tx_id, "accepted": false, "reason": "queue closed" })),
                }
            }
            Err(err) => {
                results.push(json!({ "accepted": false, "reason": err.to_string() }));
            }
        }
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "results": results }))))
}

pub async fn transaction_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&headers, &state.config)?;
    if id.len() > 128 {
        return Err(AppError::InvalidInput("invalid transaction id".into()));
    }

    let record = state
        .store
        .get_transaction(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;

    Ok(Json(json!({
        "id": id,
        "status": record.status,
        "batch_id": record.batch_id,
        "created_at": record.created_at,
        "processed_at": record.processed_at,
        "error": record.error,
    })))
}

/// Returns `{root, proof}` for a confirmed transaction's Merkle leaf.
pub async fn proof(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tx_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&headers, &state.config)?;

    let (root, proof) = state
        .sequencer
        .proof_for_tx(&tx_id)
        .ok_or_else(|| AppError::NotFound(tx_id.clone()))?;

    Ok(Json(json!({
        "tx_id": tx_id,
        "root": hex::encode(root),
        "proof": proof
            .iter()
            .map(|step| json!({
                "sibling": hex::encode(step.sibling),
                "position": match step.position {
                    crate::merkle::Position::Left => "left",
                    crate::merkle::Position::Right => "right",
                },
            }))
            .collect::<Vec<_>>(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_rejects_non_hex_payload() {
        let req = SubmitRequest {
            id: "tx-1".into(),
            sender: "a".into(),
            recipient: "b".into(),
            amount: 10,
            nonce: 1,
            expiry_timestamp: 0,
            kind: TransactionKind::Transfer,
            payload: "not-hex!".into(),
            signature: "00".into(),
            priority: 0,
        };
        assert!(req.into_transaction().is_err());
    }

    #[test]
    fn submit_request_converts_valid_hex_fields() {
        let req = SubmitRequest {
            id: "tx-1".into(),
            sender: "a".into(),
            recipient: "b".into(),
            amount: 10,
            nonce: 1,
            expiry_timestamp: 0,
            kind: TransactionKind::Transfer,
            payload: "".into(),
            signature: "deadbeef".into(),
            priority: 0,
        };
        let tx = req.into_transaction().unwrap();
        assert_eq!(tx.signature, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
