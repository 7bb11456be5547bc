//! Pairing tokens for bootstrapping a peer relationship.
//!
//! A token is a shareable magnet URI carrying an encrypted payload with
//! the issuing node's reachable address:
//!
//! ```text
//! magnet:?data=<base64url(nonce || ciphertext || tag)>&key=<base64url(key)>&dn=<name>
//! ```
//!
//! The payload is AES-256-GCM encrypted with a fresh random 96-bit nonce
//! per token. Note that the decryption key travels inside the same string
//! as the ciphertext it unlocks: the scheme protects only against passive
//! eavesdroppers who never see the full token. This is a documented
//! convenience-over-security trade-off, not an oversight.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Size of the AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Size of the AES-GCM nonce in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum TokenError {
    /// The token string itself is unusable (bad URI, missing parameters,
    /// undecodable base64).
    #[error("Malformed pairing token: {0}")]
    Malformed(String),

    /// The token parsed but its payload could not be decrypted or read.
    #[error("Pairing token rejected: {0}")]
    Invalid(String),
}

/// The plaintext carried inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Random identifier for the issuing device
    pub device_id: Uuid,
    /// Reachable IP address of the issuing node
    pub addr: String,
    /// SHA-256 of the issuer's catalog snapshot at generation time
    pub catalog_hash: String,
}

impl TokenPayload {
    pub fn new(addr: String, catalog_hash: String) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            addr,
            catalog_hash,
        }
    }
}

/// Generate a fresh random 256-bit pairing key.
///
/// The key is never persisted; it lives only in the token string and in
/// whatever channel the user shares it over.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Encrypt a payload into a shareable magnet token.
pub fn generate_token(key: &[u8; KEY_LEN], payload: &TokenPayload, display_name: &str) -> String {
    let plaintext =
        serde_json::to_vec(payload).expect("TokenPayload serialization should not fail");

    let cipher = Aes256Gcm::new_from_slice(key).expect("valid key size");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .expect("AES-GCM encryption should not fail");

    // nonce || ciphertext || tag (the cipher appends the tag itself)
    let mut data = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    data.extend_from_slice(&nonce_bytes);
    data.extend_from_slice(&ciphertext);

    format!(
        "magnet:?data={}&key={}&dn={}",
        URL_SAFE.encode(&data),
        URL_SAFE.encode(key),
        display_name
    )
}

/// Decode a magnet token back into its payload and key.
pub fn decode_token(token: &str) -> Result<(TokenPayload, [u8; KEY_LEN]), TokenError> {
    let query = token
        .trim()
        .split_once("magnet:?")
        .map(|(_, query)| query)
        .ok_or_else(|| TokenError::Malformed("not a magnet URI".into()))?;

    let mut data_param = None;
    let mut key_param = None;
    for param in query.split('&') {
        match param.split_once('=') {
            Some(("data", value)) => data_param = Some(value),
            Some(("key", value)) => key_param = Some(value),
            _ => {}
        }
    }

    let data_param =
        data_param.ok_or_else(|| TokenError::Malformed("missing data parameter".into()))?;
    let key_param =
        key_param.ok_or_else(|| TokenError::Malformed("missing key parameter".into()))?;

    let data = URL_SAFE
        .decode(data_param)
        .map_err(|e| TokenError::Malformed(format!("data is not base64: {e}")))?;
    let key_bytes = URL_SAFE
        .decode(key_param)
        .map_err(|e| TokenError::Malformed(format!("key is not base64: {e}")))?;

    let key: [u8; KEY_LEN] = key_bytes
        .try_into()
        .map_err(|_| TokenError::Invalid("wrong key length".into()))?;

    if data.len() < NONCE_LEN {
        return Err(TokenError::Invalid("truncated nonce".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(&key).expect("valid key size");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| TokenError::Invalid("decryption failed".into()))?;

    let payload = serde_json::from_slice(&plaintext)
        .map_err(|e| TokenError::Invalid(format!("unreadable payload: {e}")))?;

    Ok((payload, key))
}
