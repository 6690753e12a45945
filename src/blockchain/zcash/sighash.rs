//! ZIP 243 signature hashing for transparent inputs and signature canonicalization
//!
//! The final digest is personalized with the consensus branch id carried by
//! the skeleton, so a skeleton built against a stale epoch produces signatures
//! the network rejects even though they verify locally.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, Verification};

use crate::blockchain::zcash::transaction::{
    put_u32_le, put_u64_le, put_var_bytes, TransactionSkeleton,
};
use crate::error::{AppError, AppResult};

pub const SIGHASH_ALL: u8 = 0x01;

// ZIP 243 personalization strings
const ZCASH_PREVOUTS_HASH: &[u8; 16] = b"ZcashPrevoutHash";
const ZCASH_SEQUENCE_HASH: &[u8; 16] = b"ZcashSequencHash";
const ZCASH_OUTPUTS_HASH: &[u8; 16] = b"ZcashOutputsHash";
const ZCASH_SIGHASH_PREFIX: &[u8; 12] = b"ZcashSigHash";

/// BLAKE2b-256 hash with a 16-byte personalization
fn blake2b_256(personalization: &[u8; 16], data: &[u8]) -> [u8; 32] {
    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .personal(personalization)
        .hash(data);

    let mut output = [0u8; 32];
    output.copy_from_slice(hash.as_bytes());
    output
}

/// `ZcashSigHash` followed by the little-endian consensus branch id
fn sighash_personalization(epoch_id: u32) -> [u8; 16] {
    let mut pers = [0u8; 16];
    pers[..12].copy_from_slice(ZCASH_SIGHASH_PREFIX);
    pers[12..].copy_from_slice(&epoch_id.to_le_bytes());
    pers
}

fn hash_prevouts(skeleton: &TransactionSkeleton) -> [u8; 32] {
    let mut data = Vec::with_capacity(skeleton.inputs().len() * 36);
    for input in skeleton.inputs() {
        data.extend_from_slice(&input.outpoint.txid.to_wire_bytes());
        put_u32_le(&mut data, input.outpoint.vout);
    }
    blake2b_256(ZCASH_PREVOUTS_HASH, &data)
}

fn hash_sequences(skeleton: &TransactionSkeleton) -> [u8; 32] {
    let mut data = Vec::with_capacity(skeleton.inputs().len() * 4);
    for input in skeleton.inputs() {
        put_u32_le(&mut data, input.sequence);
    }
    blake2b_256(ZCASH_SEQUENCE_HASH, &data)
}

fn hash_outputs(skeleton: &TransactionSkeleton) -> [u8; 32] {
    let mut data = Vec::new();
    for output in skeleton.outputs() {
        put_u64_le(&mut data, output.value);
        put_var_bytes(&mut data, &output.script_pubkey);
    }
    blake2b_256(ZCASH_OUTPUTS_HASH, &data)
}

/// Digest a signer must sign for input `input_index` (SIGHASH_ALL only)
pub fn signature_hash(skeleton: &TransactionSkeleton, input_index: usize) -> AppResult<[u8; 32]> {
    let input = skeleton.inputs().get(input_index).ok_or_else(|| {
        AppError::ValidationError(format!(
            "Input index {} out of range ({} inputs)",
            input_index,
            skeleton.inputs().len()
        ))
    })?;

    let prevouts_digest = hash_prevouts(skeleton);
    let sequences_digest = hash_sequences(skeleton);
    let outputs_digest = hash_outputs(skeleton);

    tracing::debug!(
        "sighash {:?} input {}: prevouts={} sequences={} outputs={}",
        skeleton.kind(),
        input_index,
        hex::encode(prevouts_digest),
        hex::encode(sequences_digest),
        hex::encode(outputs_digest)
    );

    let mut preimage = Vec::with_capacity(512);
    put_u32_le(&mut preimage, skeleton.version());
    put_u32_le(&mut preimage, skeleton.version_group_id());
    preimage.extend_from_slice(&prevouts_digest);
    preimage.extend_from_slice(&sequences_digest);
    preimage.extend_from_slice(&outputs_digest);
    // hashJoinSplits, hashShieldedSpends, hashShieldedOutputs
    preimage.extend_from_slice(&[0u8; 32]);
    preimage.extend_from_slice(&[0u8; 32]);
    preimage.extend_from_slice(&[0u8; 32]);
    put_u32_le(&mut preimage, skeleton.lock_time());
    put_u32_le(&mut preimage, skeleton.expiry_height());
    // valueBalance
    put_u64_le(&mut preimage, 0);
    put_u32_le(&mut preimage, SIGHASH_ALL as u32);

    // The input being signed
    preimage.extend_from_slice(&input.outpoint.txid.to_wire_bytes());
    put_u32_le(&mut preimage, input.outpoint.vout);
    put_var_bytes(&mut preimage, &input.script_code);
    put_u64_le(&mut preimage, input.value);
    put_u32_le(&mut preimage, input.sequence);

    let personalization = sighash_personalization(skeleton.epoch_id());
    let sighash = blake2b_256(&personalization, &preimage);

    tracing::debug!(
        "sighash epoch 0x{:08x} input {}: {}",
        skeleton.epoch_id(),
        input_index,
        hex::encode(sighash)
    );

    Ok(sighash)
}

/// Digests for every input, in input order
pub fn signature_hashes(skeleton: &TransactionSkeleton) -> AppResult<Vec<[u8; 32]>> {
    (0..skeleton.inputs().len())
        .map(|i| signature_hash(skeleton, i))
        .collect()
}

/// Parse a caller-supplied ECDSA signature and force the low-S form.
///
/// Accepts a raw 64-byte `r || s` signature or a DER signature, the latter
/// optionally followed by the SIGHASH_ALL byte.
pub fn parse_signature(raw: &[u8]) -> AppResult<Signature> {
    let mut signature = if raw.len() == 64 {
        Signature::from_compact(raw)
            .map_err(|e| AppError::ValidationError(format!("Invalid compact signature: {}", e)))?
    } else {
        let der = match raw.split_last() {
            Some((&SIGHASH_ALL, rest)) if Signature::from_der(raw).is_err() => rest,
            _ => raw,
        };
        Signature::from_der(der)
            .map_err(|e| AppError::ValidationError(format!("Invalid DER signature: {}", e)))?
    };
    signature.normalize_s();
    Ok(signature)
}

/// Canonical script encoding: low-S DER with the SIGHASH_ALL byte appended
pub fn encode_signature(signature: &Signature) -> Vec<u8> {
    let mut normalized = *signature;
    normalized.normalize_s();
    let mut sig_bytes = normalized.serialize_der().to_vec();
    sig_bytes.push(SIGHASH_ALL);
    sig_bytes
}

/// Canonicalize raw signature bytes into their script encoding
pub fn canonicalize_signature(raw: &[u8]) -> AppResult<Vec<u8>> {
    Ok(encode_signature(&parse_signature(raw)?))
}

/// Verify a signature over a digest before it is placed in a transaction
pub fn verify_signature<C: Verification>(
    secp: &Secp256k1<C>,
    digest: &[u8; 32],
    signature: &Signature,
    public_key: &PublicKey,
) -> AppResult<()> {
    let message = Message::from_digest_slice(digest)
        .map_err(|e| AppError::InternalError(format!("Invalid sighash: {}", e)))?;
    secp.verify_ecdsa(&message, signature, public_key)
        .map_err(|e| AppError::ValidationError(format!("Signature does not verify: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::traits::{Outpoint, Txid};
    use crate::blockchain::zcash::transaction::{
        SkeletonInput, TxKind, TxOutput, SEQUENCE_FINAL,
    };
    use secp256k1::constants::CURVE_ORDER;
    use secp256k1::SecretKey;

    fn skeleton(epoch_id: u32, first_output_value: u64) -> TransactionSkeleton {
        TransactionSkeleton::new(
            TxKind::Commit,
            epoch_id,
            0,
            vec![
                SkeletonInput {
                    outpoint: Outpoint::new(Txid([0x21; 32]), 0),
                    sequence: SEQUENCE_FINAL,
                    value: 200_000,
                    script_code: vec![0x76, 0xa9, 0x14],
                },
                SkeletonInput {
                    outpoint: Outpoint::new(Txid([0x22; 32]), 5),
                    sequence: SEQUENCE_FINAL,
                    value: 50_000,
                    script_code: vec![0x76, 0xa9, 0x14],
                },
            ],
            vec![
                TxOutput { value: first_output_value, script_pubkey: vec![0xa9, 0x14] },
                TxOutput { value: 10_000, script_pubkey: vec![0x76, 0xa9] },
            ],
        )
        .unwrap()
    }

    /// order - s, big-endian
    fn negate_scalar(s: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let mut d = CURVE_ORDER[i] as i16 - s[i] as i16 - borrow;
            borrow = if d < 0 {
                d += 256;
                1
            } else {
                0
            };
            out[i] = d as u8;
        }
        out
    }

    #[test]
    fn test_personalization_carries_epoch() {
        let pers = sighash_personalization(0xc8e71055);
        assert_eq!(&pers[..12], b"ZcashSigHash");
        assert_eq!(&pers[12..], &[0x55, 0x10, 0xe7, 0xc8]);
    }

    #[test]
    fn test_sighash_deterministic() {
        let tx = skeleton(0xc8e71055, 150_000);
        let a = signature_hash(&tx, 0).unwrap();
        let b = signature_hash(&tx.clone(), 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, signature_hash(&tx, 1).unwrap());
        assert!(signature_hash(&tx, 2).is_err());
    }

    #[test]
    fn test_sighash_commits_to_outputs_and_epoch() {
        let base = signature_hash(&skeleton(0xc8e71055, 150_000), 0).unwrap();
        assert_ne!(base, signature_hash(&skeleton(0xc8e71055, 150_001), 0).unwrap());
        assert_ne!(base, signature_hash(&skeleton(0x4dec4df0, 150_000), 0).unwrap());
    }

    #[test]
    fn test_low_s_canonicalization() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let digest = signature_hash(&skeleton(0xc8e71055, 150_000), 0).unwrap();
        let msg = Message::from_digest_slice(&digest).unwrap();

        let low = secp.sign_ecdsa(&msg, &sk).serialize_compact();
        let mut high = low;
        let s: [u8; 32] = low[32..].try_into().unwrap();
        high[32..].copy_from_slice(&negate_scalar(&s));
        assert_ne!(high, low);

        let parsed = parse_signature(&high).unwrap();
        assert_eq!(parsed.serialize_compact(), low);
        verify_signature(&secp, &digest, &parsed, &pk).unwrap();

        let encoded = canonicalize_signature(&high).unwrap();
        assert_eq!(*encoded.last().unwrap(), SIGHASH_ALL);
        assert_eq!(encoded[0], 0x30);
        assert_eq!(encoded[1] as usize, encoded.len() - 3);
    }

    #[test]
    fn test_der_with_hashtype_accepted() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x07; 32]).unwrap();
        let digest = [9u8; 32];
        let sig = secp.sign_ecdsa(&Message::from_digest_slice(&digest).unwrap(), &sk);
        let encoded = encode_signature(&sig);
        assert_eq!(parse_signature(&encoded).unwrap(), sig);
        assert_eq!(parse_signature(&encoded[..encoded.len() - 1]).unwrap(), sig);
        assert!(parse_signature(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x07; 32]).unwrap();
        let other = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x08; 32]).unwrap());
        let digest = [3u8; 32];
        let sig = secp.sign_ecdsa(&Message::from_digest_slice(&digest).unwrap(), &sk);
        assert!(verify_signature(&secp, &digest, &sig, &other).is_err());
    }
}
