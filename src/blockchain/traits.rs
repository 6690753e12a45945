use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// Transaction identifier, stored in display (big-endian) byte order.
/// The wire and sighash encodings use the byte-reversed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn from_wire_bytes(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Txid(bytes)
    }

    pub fn to_wire_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Txid {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| AppError::ValidationError(format!("Invalid txid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            AppError::ValidationError(format!(
                "Invalid txid length: expected 32 bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Txid(bytes))
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to one output of a prior transaction; the lock key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl FromStr for Outpoint {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or_else(|| AppError::ValidationError(format!("Invalid outpoint '{}'", s)))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|e| AppError::ValidationError(format!("Invalid outpoint index: {}", e)))?;
        Ok(Outpoint::new(txid.parse()?, vout))
    }
}

/// Spendable output snapshot fetched from a UTXO source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInput {
    pub outpoint: Outpoint,
    /// Value in zatoshis
    pub value: u64,
    pub address: String,
    /// scriptPubKey of the output being spent
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Every external collaborator has a name for logs and error reports
pub trait NamedProvider: Send + Sync {
    fn name(&self) -> &str;
}

/// Ledger index returning the spendable outputs of an address
#[async_trait]
pub trait UtxoSource: NamedProvider {
    /// May return an empty set; only an unreachable provider is an error
    async fn fetch_spendable_inputs(&self, address: &str) -> AppResult<Vec<FundingInput>>;
}

/// Index answering whether an output already carries an inscription
#[async_trait]
pub trait InscriptionIndex: NamedProvider {
    async fn is_output_inscribed(&self, outpoint: &Outpoint) -> AppResult<bool>;
}

/// Source of the active consensus branch (network epoch) identifier
#[async_trait]
pub trait EpochSource: NamedProvider {
    async fn current_epoch_id(&self) -> AppResult<u32>;
}

/// Network relay for finished transactions
#[async_trait]
pub trait Broadcaster: NamedProvider {
    /// Returns the accepted transaction id in display order
    async fn broadcast(&self, tx_bytes: &[u8]) -> AppResult<Txid>;
}

/// Completed inscription as handed to the recording collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionRecord {
    pub inscription_id: String,
    pub commit_txid: Txid,
    pub reveal_txid: Txid,
    pub owner_address: String,
    pub content_type: String,
    pub content_length: u64,
    pub ticker: Option<String>,
}

/// Persists completed inscriptions for display
#[async_trait]
pub trait InscriptionRecorder: Send + Sync {
    async fn record(&self, record: &InscriptionRecord) -> AppResult<()>;
}
