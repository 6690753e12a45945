use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::blockchain::traits::{hex_bytes, FundingInput, Outpoint, Txid};
use crate::blockchain::zcash::transaction::TransactionSkeleton;

/// Exclusive claim on one outpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoLock {
    pub outpoint: Outpoint,
    pub owner_address: String,
    pub attempt_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl UtxoLock {
    /// Locks belong to one attempt; a second attempt of the same owner does
    /// not hold them
    pub fn is_held_by(&self, owner_address: &str, attempt_id: &str) -> bool {
        self.owner_address == owner_address && self.attempt_id == attempt_id
    }
}

/// Result of an all-or-nothing lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The first lock found held by another attempt
    Conflict(UtxoLock),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "VARCHAR")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Prepared,
    Broadcast,
    Completed,
    Failed,
}

impl ContextStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextStatus::Completed | ContextStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextStatus::Prepared => "prepared",
            ContextStatus::Broadcast => "broadcast",
            ContextStatus::Completed => "completed",
            ContextStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "VARCHAR")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Inscription,
    Split,
}

/// Everything the reveal phase needs, fixed when the commit is prepared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionPlan {
    pub content_type: String,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    pub ticker: Option<String>,
    #[serde(with = "hex_bytes")]
    pub redeem_script: Vec<u8>,
    pub inscription_value: u64,
    pub reveal_fee: u64,
    pub destination_address: String,
}

/// Durable record of one inscription or split attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub attempt_id: String,
    pub kind: ContextKind,
    pub status: ContextStatus,
    pub owner_address: String,
    /// Compressed public key (hex) every signature is checked against
    pub public_key: String,
    pub funding_inputs: Vec<FundingInput>,
    pub inscription: Option<InscriptionPlan>,
    pub platform_fee: u64,
    /// Commit or split transaction awaiting signatures
    pub funding_tx: TransactionSkeleton,
    pub funding_txid: Option<Txid>,
    pub reveal_tx: Option<TransactionSkeleton>,
    pub reveal_txid: Option<Txid>,
    pub inscription_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionContext {
    pub fn outpoints(&self) -> Vec<Outpoint> {
        self.funding_inputs.iter().map(|input| input.outpoint).collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Opaque 128-bit attempt identifier
pub fn new_attempt_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
