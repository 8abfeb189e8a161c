//! Keypair generation and the base58 encodings used on the wire.
//!
//! Public keys travel as base58 of the raw 32-byte ed25519 verifying key.
//! Secrets are exported/imported as base58 of the 32-byte seed. A key's
//! `keyID` — the value of its `keyID` identifier — is the base58 encoding of
//! the first 20 bytes of SHA-256 of the raw public key, a truncated-hash
//! address in the usual style.

use ed25519_dalek::SigningKey;

use crate::canonical::sha256;
use crate::error::CodecError;

/// Number of public-key digest bytes kept in a keyID.
const KEY_ID_LEN: usize = 20;

/// Generate a fresh ed25519 keypair.
pub fn generate() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// base58 of the raw verifying key.
pub fn encode_public(key: &SigningKey) -> String {
    bs58::encode(key.verifying_key().to_bytes()).into_string()
}

/// base58 of the 32-byte secret seed.
pub fn encode_secret(key: &SigningKey) -> String {
    bs58::encode(key.to_bytes()).into_string()
}

/// Import a base58-encoded secret seed.
pub fn decode_secret(encoded: &str) -> Result<SigningKey, CodecError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| CodecError::InvalidKey)?;
    let seed: [u8; 32] = bytes.try_into().map_err(|_| CodecError::InvalidKey)?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Derive the keyID for a base58-encoded public key.
pub fn key_id_from_public(pub_key_b58: &str) -> Result<String, CodecError> {
    let bytes = bs58::decode(pub_key_b58)
        .into_vec()
        .map_err(|_| CodecError::InvalidKey)?;
    if bytes.len() != 32 {
        return Err(CodecError::InvalidKey);
    }
    Ok(key_id_from_bytes(&bytes))
}

/// Derive the keyID for a signing key.
pub fn key_id(key: &SigningKey) -> String {
    key_id_from_bytes(&key.verifying_key().to_bytes())
}

fn key_id_from_bytes(pub_bytes: &[u8]) -> String {
    let digest = sha256(pub_bytes);
    bs58::encode(&digest[..KEY_ID_LEN]).into_string()
}
