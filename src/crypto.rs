//! Credential vault using AES-256-GCM
//!
//! Integration configuration blobs are sealed with a process-wide key before
//! they are written to the database. Each call draws a fresh random nonce, and
//! the ciphertext is bound to its owning row through additional authenticated
//! data (`org_id|provider|integration_id`).
//!
//! Wire format: `0x01 || nonce(12) || ciphertext+tag`.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use thiserror::Error;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;
use crate::models::IntegrationConfig;
use crate::models::integration::Model as IntegrationModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;
const KEY_LEN: usize = 32;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("decrypted configuration is malformed: {0}")]
    MalformedPayload(String),
}

/// Errors raised while constructing the vault at startup.
#[derive(Debug, Error)]
pub enum VaultInitError {
    #[error("credential encryption key is required in profile '{profile}'")]
    MissingKey { profile: String },
    #[error(transparent)]
    InvalidKey(#[from] CryptoError),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Random key for profiles that tolerate credentials not surviving a restart.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        ZeroizingKey(bytes)
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
///
/// There is no plaintext fallback: anything without the version marker is
/// rejected.
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if !is_encrypted_payload(ciphertext) {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// Process-wide credential vault.
#[derive(Clone)]
pub struct CredentialVault {
    key: CryptoKey,
}

impl CredentialVault {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }

    /// Build the vault from configuration.
    ///
    /// A missing key is fatal in every profile except `local` and `test`,
    /// which fall back to an ephemeral key.
    pub fn from_config(config: &AppConfig) -> Result<Self, VaultInitError> {
        match config.crypto_key.as_ref() {
            Some(bytes) => Ok(Self::new(CryptoKey::new(bytes.clone())?)),
            None if config.encryption_required() => Err(VaultInitError::MissingKey {
                profile: config.profile.clone(),
            }),
            None => {
                warn!(
                    profile = %config.profile,
                    "No credential key configured; using an ephemeral key, stored credentials will not survive a restart"
                );
                Ok(Self::new(CryptoKey::generate()))
            }
        }
    }

    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt_bytes(&self.key, aad, plaintext)
    }

    pub fn decrypt(&self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_bytes(&self.key, aad, ciphertext)
    }

    /// Serialize and seal an integration configuration.
    pub fn seal_config(&self, aad: &str, config: &IntegrationConfig) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = serde_json::to_vec(config)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let sealed = self.encrypt(aad.as_bytes(), &plaintext);
        plaintext.zeroize();
        sealed
    }

    /// Open the sealed configuration stored on an integration row.
    pub fn open_config(&self, integration: &IntegrationModel) -> Result<IntegrationConfig, CryptoError> {
        let aad = integration.credential_aad();
        let mut plaintext = self.decrypt(aad.as_bytes(), &integration.config_ciphertext)?;
        let parsed = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::MalformedPayload(e.to_string()));
        plaintext.zeroize();
        parsed
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}
