//! Credential Hasher (spec §4.1).
//!
//! Password hashing is a single-round SHA-256 with no per-user salt — a
//! documented weakness (spec §9), kept because the storage contract (one
//! opaque hex string, constant-time compare) must survive a later swap to a
//! memory-hard KDF without touching callers. Mirrors the
//! `Sha256::new()/update()/finalize()` idiom already used in
//! `noa-tools-agent`'s `calculate_sha256`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hash a password (or any byte string) to its lowercase hex digest.
pub fn hash_password(password: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password);
    format!("{:x}", hasher.finalize())
}

/// Constant-time comparison of two hex-encoded digests.
pub fn verify_password(password: &[u8], expected_hash: &str) -> bool {
    let actual = hash_password(password);
    bool::from(actual.as_bytes().ct_eq(expected_hash.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid pre-shared key encoding: {0}")]
    InvalidKey(String),
}

/// Compute the base64 HMAC-SHA-256 signature over the canonical message
/// `agentID:hostname:timestamp`. `psk_hex` is the hex-encoded pre-shared
/// key; it is decoded once per call, matching the PSK contract in spec
/// §4.1 and §6.
pub fn sign_agent_message(
    psk_hex: &str,
    agent_id: &str,
    hostname: &str,
    timestamp: &str,
) -> Result<String, SignatureError> {
    let key = hex::decode(psk_hex).map_err(|err| SignatureError::InvalidKey(err.to_string()))?;
    let message = canonical_message(agent_id, hostname, timestamp);
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|err| SignatureError::InvalidKey(err.to_string()))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 HMAC-SHA-256 signature using constant-time comparison.
pub fn verify_agent_signature(
    psk_hex: &str,
    agent_id: &str,
    hostname: &str,
    timestamp: &str,
    signature: &str,
) -> bool {
    match sign_agent_message(psk_hex, agent_id, hostname, timestamp) {
        Ok(expected) => bool::from(expected.as_bytes().ct_eq(signature.as_bytes())),
        Err(_) => false,
    }
}

fn canonical_message(agent_id: &str, hostname: &str, timestamp: &str) -> String {
    format!("{agent_id}:{hostname}:{timestamp}")
}

/// Generate a fresh 32-byte pre-shared key, hex-encoded, for first-run
/// bootstrap (spec §4.7 "Key bootstrap").
pub fn generate_psk_hex() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
