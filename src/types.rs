//! Shared domain types used across the admission, execution, and
//! settlement pipeline.

use serde::{Deserialize, Serialize};

pub type Address = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Transfer,
    Deposit,
    Withdrawal,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub nonce: u64,
    pub expiry_timestamp: u64,
    pub kind: TransactionKind,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    /// Admission priority tier, higher is more urgent. Not part of the
    /// signed envelope — a relayer/gateway may bump it independently of
    /// the sender, so it must not change the bytes the sender signed.
    #[serde(default)]
    pub priority: u8,
}

impl Transaction {
    /// Canonical byte encoding signed by the sender. Field order and
    /// length-prefixing are fixed so the same transaction always produces
    /// the same bytes regardless of how it was decoded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.expiry_timestamp.to_be_bytes());
        buf.push(match self.kind {
            TransactionKind::Transfer => 0,
            TransactionKind::Deposit => 1,
            TransactionKind::Withdrawal => 2,
            TransactionKind::Custom => 3,
        });
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Admitted,
    Executed,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_id: String,
    pub status: TransactionStatus,
    pub processing_time_ms: u64,
    pub batch_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub last_updated: u64,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            last_updated: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Signing,
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub merkle_root: [u8; 32],
    pub tx_ids: Vec<String>,
    pub status: BatchStatus,
    pub created_at: u64,
    pub submitted_at: Option<u64>,
    pub confirmed_at: Option<u64>,
    pub anchor_signature: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub kind: String,
    pub payload_json: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Ed25519,
    Rsa2048,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub created_at: u64,
    pub active: bool,
}

/// One of three disjoint classes the reconciler repairs, content-addressed
/// by `(category, id)` rather than any size- or shape-based heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    MissingInAnchor,
    MissingInLocal,
    Inconsistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub category: DiscrepancyCategory,
    pub id: String,
    pub attempts: u32,
    pub last_attempt: Option<u64>,
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
