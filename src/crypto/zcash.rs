use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::blockchain::zcash::script::{hash160, p2pkh_script_pubkey, OP_EQUAL, OP_HASH160};
use crate::blockchain::zcash::sighash::encode_signature;
use crate::error::{AppError, AppResult};

// Zcash mainnet transparent address prefixes
const ZCASH_T1_PREFIX: [u8; 2] = [0x1C, 0xB8]; // t1 (P2PKH)
const ZCASH_T3_PREFIX: [u8; 2] = [0x1C, 0xBD]; // t3 (P2SH)

/// Zcash mainnet transparent address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparentAddress {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
}

impl TransparentAddress {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        TransparentAddress::P2pkh(hash160(&public_key.serialize()))
    }

    pub fn from_redeem_script(redeem_script: &[u8]) -> Self {
        TransparentAddress::P2sh(hash160(redeem_script))
    }

    /// Decode a base58check t1/t3 address
    pub fn parse(address: &str) -> AppResult<Self> {
        let decoded = bs58::decode(address)
            .into_vec()
            .map_err(|e| AppError::ValidationError(format!("Invalid address encoding: {}", e)))?;

        if decoded.len() != 26 {
            return Err(AppError::ValidationError(format!(
                "Invalid address length: expected 26 bytes, got {}",
                decoded.len()
            )));
        }

        // Verify checksum
        let payload = &decoded[..22];
        let checksum = &decoded[22..];
        if checksum_of(payload) != checksum {
            return Err(AppError::ValidationError("Address checksum mismatch".to_string()));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&decoded[2..22]);

        match [decoded[0], decoded[1]] {
            ZCASH_T1_PREFIX => Ok(TransparentAddress::P2pkh(hash)),
            ZCASH_T3_PREFIX => Ok(TransparentAddress::P2sh(hash)),
            prefix => Err(AppError::ValidationError(format!(
                "Unsupported address prefix: {:02x}{:02x}",
                prefix[0], prefix[1]
            ))),
        }
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        match self {
            TransparentAddress::P2pkh(hash) => p2pkh_script_pubkey(hash),
            TransparentAddress::P2sh(hash) => {
                let mut script = Vec::with_capacity(23);
                script.push(OP_HASH160);
                script.push(0x14);
                script.extend_from_slice(hash);
                script.push(OP_EQUAL);
                script
            }
        }
    }
}

impl fmt::Display for TransparentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, hash) = match self {
            TransparentAddress::P2pkh(hash) => (ZCASH_T1_PREFIX, hash),
            TransparentAddress::P2sh(hash) => (ZCASH_T3_PREFIX, hash),
        };

        let mut address_bytes = Vec::with_capacity(26);
        address_bytes.extend_from_slice(&prefix);
        address_bytes.extend_from_slice(hash);
        let checksum = checksum_of(&address_bytes);
        address_bytes.extend_from_slice(&checksum);

        f.write_str(&bs58::encode(address_bytes).into_string())
    }
}

/// First 4 bytes of double SHA-256
fn checksum_of(payload: &[u8]) -> [u8; 4] {
    let hash1 = Sha256::digest(payload);
    let hash2 = Sha256::digest(hash1);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash2[..4]);
    checksum
}

/// Parse a hex-encoded secp256k1 public key (compressed or uncompressed)
pub fn parse_public_key(public_key_hex: &str) -> AppResult<PublicKey> {
    let bytes = hex::decode(public_key_hex.trim().trim_start_matches("0x"))
        .map_err(|e| AppError::ValidationError(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| AppError::ValidationError(format!("Invalid public key: {}", e)))
}

/// Parse private key from hex or WIF format
pub fn parse_private_key(private_key: &str) -> AppResult<SecretKey> {
    let private_key = private_key.trim();
    let key_bytes = if private_key.starts_with('5')
        || private_key.starts_with('K')
        || private_key.starts_with('L')
    {
        decode_wif_private_key(private_key)?
    } else {
        let key_hex = private_key.strip_prefix("0x").unwrap_or(private_key);
        hex::decode(key_hex)
            .map_err(|e| AppError::ValidationError(format!("Invalid private key hex: {}", e)))?
    };

    if key_bytes.len() != 32 {
        return Err(AppError::ValidationError(format!(
            "Private key must be 32 bytes, got {} bytes",
            key_bytes.len()
        )));
    }

    SecretKey::from_slice(&key_bytes)
        .map_err(|e| AppError::ValidationError(format!("Invalid private key: {}", e)))
}

/// Decode a WIF (Wallet Import Format) private key
/// WIF format: Base58Check(prefix + privkey + [compression flag] + checksum)
fn decode_wif_private_key(wif: &str) -> AppResult<Vec<u8>> {
    let decoded = bs58::decode(wif)
        .into_vec()
        .map_err(|e| AppError::ValidationError(format!("Invalid WIF format: {}", e)))?;

    // 1 byte prefix + 32 bytes key + [1 byte flag] + 4 bytes checksum
    if decoded.len() != 37 && decoded.len() != 38 {
        return Err(AppError::ValidationError(format!(
            "Invalid WIF length: expected 37 or 38 bytes, got {}",
            decoded.len()
        )));
    }

    let payload_len = decoded.len() - 4;
    let payload = &decoded[..payload_len];
    if checksum_of(payload) != decoded[payload_len..] {
        return Err(AppError::ValidationError("WIF checksum mismatch".to_string()));
    }

    if payload[0] != 0x80 {
        return Err(AppError::ValidationError(format!(
            "Invalid WIF prefix: expected 0x80, got 0x{:02x}",
            payload[0]
        )));
    }

    Ok(payload[1..33].to_vec())
}

/// Server-side signer holding one transparent key
pub struct LocalSigner {
    secp: Secp256k1<secp256k1::All>,
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl LocalSigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secp,
            secret_key,
            public_key,
        }
    }

    pub fn from_private_key(private_key: &str) -> AppResult<Self> {
        Ok(Self::new(parse_private_key(private_key)?))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn address(&self) -> TransparentAddress {
        TransparentAddress::from_public_key(&self.public_key)
    }

    /// RFC 6979 ECDSA over a sighash, returned in canonical script encoding
    pub fn sign_digest(&self, digest: &[u8; 32]) -> AppResult<Vec<u8>> {
        let message = Message::from_digest_slice(digest)
            .map_err(|e| AppError::InternalError(format!("Invalid sighash: {}", e)))?;
        let signature = self.secp.sign_ecdsa(&message, &self.secret_key);
        Ok(encode_signature(&signature))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address().to_string())
            .finish_non_exhaustive()
    }
}
