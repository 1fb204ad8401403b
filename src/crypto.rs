//! AES-256-GCM encryption backing the default [`Encryptor`].
//!
//! # Token Format
//!
//! Ciphertexts handed to scripts are a single printable token:
//!
//! ```text
//! v<version>.<base64 nonce>.<base64 ciphertext>
//! ```
//!
//! The version lets hosts rotate formats without breaking stored values.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::services::Encryptor;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Current token format version.
const TOKEN_VERSION: u8 = 1;

/// Decoded encryption envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Base64-encoded nonce (12 bytes).
    pub nonce: String,
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// Version identifier.
    pub version: u8,
}

impl EncryptedData {
    /// Render as a `v<version>.<nonce>.<ciphertext>` token.
    #[must_use]
    pub fn to_token(&self) -> String {
        format!("v{}.{}.{}", self.version, self.nonce, self.ciphertext)
    }

    /// Parse a token produced by [`to_token`](Self::to_token).
    pub fn from_token(token: &str) -> Result<Self> {
        let mut parts = token.splitn(3, '.');
        let (Some(version), Some(nonce), Some(ciphertext)) =
            (parts.next(), parts.next(), parts.next())
        else {
            bail!("Malformed ciphertext token");
        };
        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u8>().ok())
            .context("Invalid ciphertext version")?;
        Ok(Self {
            nonce: nonce.to_string(),
            ciphertext: ciphertext.to_string(),
            version,
        })
    }
}

/// Encrypt plaintext using AES-256-GCM with a random nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], version: u8) -> Result<EncryptedData> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {e}"))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {e}"))?;

    Ok(EncryptedData {
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
        version,
    })
}

/// Decrypt an [`EncryptedData`] envelope using AES-256-GCM.
pub fn decrypt(key: &[u8; 32], encrypted: &EncryptedData) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {e}"))?;

    let nonce_bytes = BASE64
        .decode(&encrypted.nonce)
        .context("Invalid nonce encoding")?;
    if nonce_bytes.len() != NONCE_SIZE {
        bail!("Invalid nonce length");
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = BASE64
        .decode(&encrypted.ciphertext)
        .context("Invalid ciphertext encoding")?;

    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|e| anyhow!("Decryption failed: {e}"))
}

/// Default [`Encryptor`] holding a 256-bit key.
pub struct AesGcmEncryptor {
    key: [u8; 32],
}

impl std::fmt::Debug for AesGcmEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmEncryptor").finish_non_exhaustive()
    }
}

impl AesGcmEncryptor {
    /// Wrap a raw key.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Decode a base64 key (as stored in `EngineConfig::encryption_key`).
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .context("Invalid encryption key encoding")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("Encryption key must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    /// Random key, base64 encoded.
    #[must_use]
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        encrypt(&self.key, plaintext.as_bytes(), TOKEN_VERSION).map(|d| d.to_token())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let envelope = EncryptedData::from_token(ciphertext)?;
        if envelope.version != TOKEN_VERSION {
            bail!("Unsupported ciphertext version {}", envelope.version);
        }
        let bytes = decrypt(&self.key, &envelope)?;
        String::from_utf8(bytes).context("Decrypted data is not UTF-8")
    }
}
