//! Crypto collaborator contract plus the concrete config-blob cryptography.
//!
//! The ratchet protocols, signing scheme and inbox sealed boxes are opaque
//! collaborators behind [`SecureChannel`]; the engine never inspects their
//! state or envelopes. The synced-config encryption is NOT opaque: the blob
//! format (AES-256-GCM under the first 32 bytes of SHA-512 of the user
//! private key, 12-byte IV appended as the trailing 24 hex characters) is
//! part of this engine and implemented here.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::types::InboxKeypair;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ratchet encrypt failed: {0}")]
    RatchetEncrypt(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("inbox envelope open failed: {0}")]
    InboxOpen(String),
    #[error("config blob is malformed")]
    MalformedBlob,
    #[error("key material is not valid hex")]
    MalformedKey,
    #[error("config encrypt failed")]
    Encrypt,
    #[error("config decrypt failed")]
    Decrypt,
}

/// One ratchet advance for a space conversation: the replacement session
/// state and the sealed envelope to transmit.
#[derive(Debug, Clone)]
pub struct RatchetStep {
    pub new_state: String,
    pub envelope: String,
}

/// One ratchet advance for a DM session. Whether the collaborator ran a
/// sender-init or a continuing ratchet is its own business; the engine only
/// persists the replacement state and transmits the envelope.
#[derive(Debug, Clone)]
pub struct DmStep {
    pub new_state: String,
    pub envelope: String,
    /// Inbox address this device should listen on for the reply leg.
    pub receiving_inbox: String,
    pub sent_accept: bool,
}

/// Signing, verification and ratchet encryption. Treated as opaque and
/// already correct; implementations must be deterministic given the same
/// session state.
pub trait SecureChannel: Send + Sync {
    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool;

    fn ratchet_encrypt(&self, state: &str, plaintext: &[u8]) -> Result<RatchetStep, CryptoError>;

    fn dm_encrypt(&self, state: &str, plaintext: &[u8]) -> Result<DmStep, CryptoError>;

    fn open_inbox_envelope(
        &self,
        inbox_private_key: &[u8],
        ephemeral_public_key: &[u8],
        sealed: &str,
    ) -> Result<Vec<u8>, CryptoError>;

    fn generate_inbox_keypair(&self) -> InboxKeypair;
}

/// Decode hex-encoded key material as stored in space key rows.
pub fn decode_key(hex_key: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(hex_key).map_err(|_| CryptoError::MalformedKey)
}

const IV_LEN: usize = 12;
const IV_HEX_LEN: usize = IV_LEN * 2;

/// Symmetric key for the config blob: first 32 bytes of SHA-512 over the
/// user private key. Wiped when dropped.
pub fn derive_config_key(user_private_key: &[u8]) -> Zeroizing<[u8; 32]> {
    let digest = Sha512::digest(user_private_key);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    Zeroizing::new(key)
}

/// Encrypt a config JSON document. The random IV is appended to the
/// hex ciphertext, so the stored string always ends in 24 hex chars of IV.
pub fn seal_config(key: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(format!("{}{}", hex::encode(ciphertext), hex::encode(iv)))
}

/// Inverse of [`seal_config`].
pub fn open_config(key: &[u8; 32], blob: &str) -> Result<Vec<u8>, CryptoError> {
    if blob.len() <= IV_HEX_LEN {
        return Err(CryptoError::MalformedBlob);
    }
    let (ct_hex, iv_hex) = blob.split_at(blob.len() - IV_HEX_LEN);
    let iv = hex::decode(iv_hex).map_err(|_| CryptoError::MalformedBlob)?;
    let ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::MalformedBlob)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::Decrypt)
}

/// Preimage for the settings-record signature: the stored blob followed by
/// the big-endian timestamp. Both the signer and the verifier in this crate
/// use this layout.
pub fn config_signing_bytes(blob: &str, timestamp: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(blob.len() + 8);
    out.extend_from_slice(blob.as_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out
}
