//! Zcash v4 (Sapling, overwintered) transparent transaction codec
//!
//! Transactions are described by an immutable [`TransactionSkeleton`] which
//! carries everything the signature hash needs (spent values and script codes),
//! and are put on the wire as a [`RawTransaction`].
//!
//! References:
//! - ZIP 202: Version 3 transaction format for Overwinter
//! - ZIP 243: Transaction signature validation for Sapling

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blockchain::traits::{hex_bytes, Outpoint, Txid};
use crate::error::{AppError, AppResult};

// Zcash v4 transaction constants
pub const TX_VERSION: u32 = 4;
pub const OVERWINTERED_FLAG: u32 = 1 << 31;
pub const TX_HEADER: u32 = TX_VERSION | OVERWINTERED_FLAG; // 0x80000004
pub const SAPLING_VERSION_GROUP_ID: u32 = 0x892F2085;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;
const MAX_TX_ELEMENTS: u64 = 100_000;

/// Which phase of an attempt a skeleton belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Commit,
    Reveal,
    Split,
}

/// Input of a skeleton: what is spent plus the signing context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonInput {
    pub outpoint: Outpoint,
    pub sequence: u32,
    /// Value of the spent output in zatoshis
    pub value: u64,
    /// scriptPubKey for P2PKH spends, the redeem script for P2SH spends
    #[serde(with = "hex_bytes")]
    pub script_code: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in zatoshis
    pub value: u64,
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

/// Immutable transaction description that digests are taken from.
///
/// There are no setters: once a sighash was computed over a skeleton, any
/// change must produce a new skeleton and new signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSkeleton {
    kind: TxKind,
    version: u32,
    version_group_id: u32,
    epoch_id: u32,
    lock_time: u32,
    expiry_height: u32,
    inputs: Vec<SkeletonInput>,
    outputs: Vec<TxOutput>,
}

impl TransactionSkeleton {
    pub fn new(
        kind: TxKind,
        epoch_id: u32,
        expiry_height: u32,
        inputs: Vec<SkeletonInput>,
        outputs: Vec<TxOutput>,
    ) -> AppResult<Self> {
        if inputs.is_empty() {
            return Err(AppError::ValidationError("Transaction has no inputs".to_string()));
        }
        if outputs.is_empty() {
            return Err(AppError::ValidationError("Transaction has no outputs".to_string()));
        }
        for input in &inputs {
            check_script_len(&input.script_code)?;
            check_value(input.value)?;
        }
        let mut total_out: u64 = 0;
        for output in &outputs {
            check_script_len(&output.script_pubkey)?;
            check_value(output.value)?;
            total_out = total_out
                .checked_add(output.value)
                .filter(|v| *v <= MAX_MONEY)
                .ok_or_else(|| AppError::ValidationError("Output total overflows".to_string()))?;
        }
        let total_in: u64 = inputs.iter().map(|i| i.value).sum();
        if total_out > total_in {
            return Err(AppError::ValidationError(format!(
                "Outputs ({} zatoshis) exceed inputs ({} zatoshis)",
                total_out, total_in
            )));
        }

        Ok(Self {
            kind,
            version: TX_HEADER,
            version_group_id: SAPLING_VERSION_GROUP_ID,
            epoch_id,
            lock_time: 0,
            expiry_height,
            inputs,
            outputs,
        })
    }

    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Header field including the overwintered flag
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn version_group_id(&self) -> u32 {
        self.version_group_id
    }

    pub fn epoch_id(&self) -> u32 {
        self.epoch_id
    }

    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    pub fn expiry_height(&self) -> u32 {
        self.expiry_height
    }

    pub fn inputs(&self) -> &[SkeletonInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Implied miner fee
    pub fn fee(&self) -> u64 {
        self.input_total() - self.output_total()
    }

    /// Attach scriptSigs and produce the wire form
    pub fn to_raw(&self, script_sigs: &[Vec<u8>]) -> AppResult<RawTransaction> {
        if script_sigs.len() != self.inputs.len() {
            return Err(AppError::ValidationError(format!(
                "Expected {} scriptSigs, got {}",
                self.inputs.len(),
                script_sigs.len()
            )));
        }

        Ok(RawTransaction {
            version: self.version,
            version_group_id: self.version_group_id,
            lock_time: self.lock_time,
            expiry_height: self.expiry_height,
            inputs: self
                .inputs
                .iter()
                .zip(script_sigs)
                .map(|(input, script_sig)| RawInput {
                    outpoint: input.outpoint,
                    script_sig: script_sig.clone(),
                    sequence: input.sequence,
                })
                .collect(),
            outputs: self.outputs.clone(),
        })
    }
}

fn check_script_len(script: &[u8]) -> AppResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(AppError::ValidationError(format!(
            "Script of {} bytes exceeds the {} byte limit",
            script.len(),
            MAX_SCRIPT_SIZE
        )));
    }
    Ok(())
}

fn check_value(value: u64) -> AppResult<()> {
    if value > MAX_MONEY {
        return Err(AppError::ValidationError(format!(
            "Value {} exceeds the money range",
            value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInput {
    pub outpoint: Outpoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Wire-level v4 transaction with an empty shielded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub version: u32,
    pub version_group_id: u32,
    pub lock_time: u32,
    pub expiry_height: u32,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<TxOutput>,
}

impl RawTransaction {
    pub fn serialize(&self) -> AppResult<Vec<u8>> {
        let mut tx = Vec::new();

        // Header
        put_u32_le(&mut tx, self.version);
        put_u32_le(&mut tx, self.version_group_id);

        // Transparent inputs
        put_compact_size(&mut tx, self.inputs.len() as u64);
        for input in &self.inputs {
            tx.extend_from_slice(&input.outpoint.txid.to_wire_bytes());
            put_u32_le(&mut tx, input.outpoint.vout);
            check_script_len(&input.script_sig)?;
            put_var_bytes(&mut tx, &input.script_sig);
            put_u32_le(&mut tx, input.sequence);
        }

        // Transparent outputs
        put_compact_size(&mut tx, self.outputs.len() as u64);
        for output in &self.outputs {
            check_value(output.value)?;
            check_script_len(&output.script_pubkey)?;
            put_u64_le(&mut tx, output.value);
            put_var_bytes(&mut tx, &output.script_pubkey);
        }

        put_u32_le(&mut tx, self.lock_time);
        put_u32_le(&mut tx, self.expiry_height);

        // valueBalance, nShieldedSpend, nShieldedOutput, nJoinSplit
        put_u64_le(&mut tx, 0);
        tx.push(0x00);
        tx.push(0x00);
        tx.push(0x00);

        tracing::debug!("Serialized transaction ({} bytes): {}", tx.len(), hex::encode(&tx));

        Ok(tx)
    }

    pub fn deserialize(bytes: &[u8]) -> AppResult<Self> {
        let mut cursor = Cursor::new(bytes);

        let version = cursor.read_u32_le()?;
        if version != TX_HEADER {
            return Err(AppError::ValidationError(format!(
                "Unsupported transaction header 0x{:08x}",
                version
            )));
        }
        let version_group_id = cursor.read_u32_le()?;
        if version_group_id != SAPLING_VERSION_GROUP_ID {
            return Err(AppError::ValidationError(format!(
                "Unsupported version group id 0x{:08x}",
                version_group_id
            )));
        }

        let input_count = cursor.read_count()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let wire: [u8; 32] = cursor.read_array()?;
            let vout = cursor.read_u32_le()?;
            let script_sig = cursor.read_var_bytes()?;
            let sequence = cursor.read_u32_le()?;
            inputs.push(RawInput {
                outpoint: Outpoint::new(Txid::from_wire_bytes(wire), vout),
                script_sig,
                sequence,
            });
        }

        let output_count = cursor.read_count()?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = cursor.read_u64_le()?;
            check_value(value)?;
            let script_pubkey = cursor.read_var_bytes()?;
            outputs.push(TxOutput { value, script_pubkey });
        }

        let lock_time = cursor.read_u32_le()?;
        let expiry_height = cursor.read_u32_le()?;

        let value_balance = cursor.read_u64_le()?;
        let spends = cursor.read_compact_size()?;
        let shielded_outputs = cursor.read_compact_size()?;
        let join_splits = cursor.read_compact_size()?;
        if value_balance != 0 || spends != 0 || shielded_outputs != 0 || join_splits != 0 {
            return Err(AppError::ValidationError(
                "Shielded components are not supported".to_string(),
            ));
        }
        if cursor.remaining() != 0 {
            return Err(AppError::ValidationError(format!(
                "{} trailing bytes after transaction",
                cursor.remaining()
            )));
        }

        Ok(Self {
            version,
            version_group_id,
            lock_time,
            expiry_height,
            inputs,
            outputs,
        })
    }

    pub fn txid(&self) -> AppResult<Txid> {
        Ok(txid_of(&self.serialize()?))
    }
}

/// Serialize a skeleton with its scriptSigs to wire bytes
pub fn serialize_transaction(
    skeleton: &TransactionSkeleton,
    script_sigs: &[Vec<u8>],
) -> AppResult<Vec<u8>> {
    skeleton.to_raw(script_sigs)?.serialize()
}

/// Double SHA-256 of the wire bytes, in display order
pub fn txid_of(tx_bytes: &[u8]) -> Txid {
    let first = Sha256::digest(tx_bytes);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    Txid::from_wire_bytes(hash)
}

/// Serialize a compact size integer (Bitcoin/Zcash varint)
pub fn encode_compact_size(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffffffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

pub fn put_compact_size(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&encode_compact_size(n));
}

pub fn put_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Compact-size length prefix followed by the bytes
pub fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_exact(&mut self, len: usize) -> AppResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(AppError::ValidationError(format!(
                "Truncated transaction: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> AppResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    fn read_u32_le(&mut self) -> AppResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64_le(&mut self) -> AppResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_compact_size(&mut self) -> AppResult<u64> {
        let tag = self.read_exact(1)?[0];
        let (n, min) = match tag {
            0xfd => (u16::from_le_bytes(self.read_array()?) as u64, 0xfd),
            0xfe => (u32::from_le_bytes(self.read_array()?) as u64, 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            n => return Ok(n as u64),
        };
        if n < min {
            return Err(AppError::ValidationError(format!(
                "Non-canonical compact size {}",
                n
            )));
        }
        Ok(n)
    }

    fn read_count(&mut self) -> AppResult<usize> {
        let n = self.read_compact_size()?;
        if n > MAX_TX_ELEMENTS {
            return Err(AppError::ValidationError(format!("Element count {} too large", n)));
        }
        Ok(n as usize)
    }

    fn read_var_bytes(&mut self) -> AppResult<Vec<u8>> {
        let len = self.read_compact_size()?;
        if len > MAX_SCRIPT_SIZE as u64 {
            return Err(AppError::ValidationError(format!(
                "Script of {} bytes exceeds the {} byte limit",
                len, MAX_SCRIPT_SIZE
            )));
        }
        Ok(self.read_exact(len as usize)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_skeleton() -> TransactionSkeleton {
        TransactionSkeleton::new(
            TxKind::Commit,
            0xc8e71055,
            0,
            vec![SkeletonInput {
                outpoint: Outpoint::new(Txid([0x11; 32]), 3),
                sequence: SEQUENCE_FINAL,
                value: 100_000,
                script_code: vec![0x76, 0xa9, 0x14],
            }],
            vec![
                TxOutput { value: 60_000, script_pubkey: vec![0xa9, 0x14, 0x00, 0x87] },
                TxOutput { value: 30_000, script_pubkey: vec![0x76, 0xa9] },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_compact_size() {
        assert_eq!(encode_compact_size(0), vec![0x00]);
        assert_eq!(encode_compact_size(252), vec![0xfc]);
        assert_eq!(encode_compact_size(253), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_compact_size(0x1234), vec![0xfd, 0x34, 0x12]);
        assert_eq!(encode_compact_size(0x10000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(encode_compact_size(0x1_0000_0000)[0], 0xff);
    }

    #[test]
    fn test_header_and_trailer_layout() {
        let bytes = serialize_transaction(&sample_skeleton(), &[vec![0xaa, 0xbb]]).unwrap();
        assert_eq!(&bytes[..4], &[0x04, 0x00, 0x00, 0x80]);
        assert_eq!(&bytes[4..8], &[0x85, 0x20, 0x2f, 0x89]);
        // input count, then the reversed txid
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..41], &[0x11; 32]);
        assert_eq!(&bytes[41..45], &[3, 0, 0, 0]);
        // lock time, expiry, value balance and three empty shielded counts
        let tail = &bytes[bytes.len() - 19..];
        assert_eq!(tail, &[0u8; 19]);
    }

    #[test]
    fn test_round_trip() {
        let raw = sample_skeleton().to_raw(&[vec![0x47; 106]]).unwrap();
        let bytes = raw.serialize().unwrap();
        let decoded = RawTransaction::deserialize(&bytes).unwrap();
        assert_eq!(decoded, raw);
        assert_eq!(decoded.txid().unwrap(), txid_of(&bytes));
    }

    #[test]
    fn test_round_trip_large_script_sig() {
        // forces the 3-byte compact size form
        let raw = sample_skeleton().to_raw(&[vec![0x01; 5_400]]).unwrap();
        let bytes = raw.serialize().unwrap();
        assert_eq!(RawTransaction::deserialize(&bytes).unwrap(), raw);
    }

    #[test]
    fn test_rejects_malformed() {
        let bytes = serialize_transaction(&sample_skeleton(), &[vec![]]).unwrap();
        assert!(RawTransaction::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(RawTransaction::deserialize(&trailing).is_err());

        let mut v5 = bytes.clone();
        v5[0] = 0x05;
        assert!(RawTransaction::deserialize(&v5).is_err());
    }

    #[test]
    fn test_fail_fast_on_oversized_script() {
        let raw = sample_skeleton().to_raw(&[vec![0u8; MAX_SCRIPT_SIZE + 1]]).unwrap();
        assert!(raw.serialize().is_err());
        assert!(sample_skeleton().to_raw(&[]).is_err());
    }

    #[test]
    fn test_skeleton_validation() {
        let input = SkeletonInput {
            outpoint: Outpoint::new(Txid([1; 32]), 0),
            sequence: SEQUENCE_FINAL,
            value: 1_000,
            script_code: vec![],
        };
        let out = |value| TxOutput { value, script_pubkey: vec![0x51] };

        assert!(TransactionSkeleton::new(TxKind::Split, 1, 0, vec![], vec![out(1)]).is_err());
        assert!(TransactionSkeleton::new(TxKind::Split, 1, 0, vec![input.clone()], vec![]).is_err());
        assert!(
            TransactionSkeleton::new(TxKind::Split, 1, 0, vec![input.clone()], vec![out(1_001)])
                .is_err()
        );
        let ok = TransactionSkeleton::new(TxKind::Split, 1, 0, vec![input], vec![out(900)]).unwrap();
        assert_eq!(ok.fee(), 100);
        assert_eq!(ok.version(), 0x80000004);
    }
}
