//! Signing-key encryption at rest using AES-256-GCM.
//!
//! The keystore turns the client's plaintext signing key into an opaque
//! blob that can sit in a config file, and back. AES-256-GCM provides
//! confidentiality + integrity; the AES key is derived from a passphrase
//! via iterated SHA-256.

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KEY_DERIVATION_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// An encrypted signing key with its nonce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedKey {
    /// 12-byte random nonce used for AES-GCM encryption
    pub nonce: Vec<u8>,
    /// The AES-256-GCM ciphertext (includes 16-byte auth tag)
    pub ciphertext: Vec<u8>,
}

impl EncryptedKey {
    /// Encode as `nonce.ciphertext` in base64 for config embedding.
    pub fn to_base64(&self) -> String {
        format!(
            "{}.{}",
            BASE64.encode(&self.nonce),
            BASE64.encode(&self.ciphertext)
        )
    }

    /// Parse the `nonce.ciphertext` base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self, KeystoreError> {
        let (nonce_part, cipher_part) = encoded
            .split_once('.')
            .ok_or_else(|| KeystoreError::Malformed("expected nonce.ciphertext".into()))?;
        let nonce = BASE64
            .decode(nonce_part)
            .map_err(|e| KeystoreError::Malformed(format!("bad nonce encoding: {e}")))?;
        let ciphertext = BASE64
            .decode(cipher_part)
            .map_err(|e| KeystoreError::Malformed(format!("bad ciphertext encoding: {e}")))?;
        Ok(Self { nonce, ciphertext })
    }
}

/// Encrypts and decrypts the signing key with a passphrase-derived AES key.
pub struct Keystore {
    key: [u8; 32],
}

impl Keystore {
    /// Create a keystore from a passphrase.
    ///
    /// Derives a 32-byte key using iterated SHA-256 hashing (100,000
    /// rounds). Rejects empty passphrases to prevent weak keys.
    pub fn new(passphrase: &str) -> Result<Self, KeystoreError> {
        if passphrase.is_empty() {
            return Err(KeystoreError::EmptyPassphrase);
        }
        Ok(Self {
            key: derive_key(passphrase),
        })
    }

    /// Encrypt a plaintext signing key.
    ///
    /// Each call generates a fresh random 12-byte nonce, so encrypting the
    /// same key twice produces different ciphertexts.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedKey, KeystoreError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| KeystoreError::EncryptionFailed(e.to_string()))?;
        let nonce_bytes = generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| KeystoreError::EncryptionFailed(e.to_string()))?;
        Ok(EncryptedKey {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an encrypted signing key back into a wrapped secret.
    ///
    /// Fails if the passphrase is wrong or the ciphertext was tampered with
    /// (authenticated encryption detects modification).
    pub fn decrypt(&self, encrypted: &EncryptedKey) -> Result<SecretString, KeystoreError> {
        if encrypted.nonce.len() != NONCE_LEN {
            return Err(KeystoreError::DecryptionFailed(format!(
                "invalid nonce length: expected {NONCE_LEN}, got {}",
                encrypted.nonce.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| KeystoreError::DecryptionFailed(format!("key init failed: {e}")))?;
        let nonce = Nonce::from_slice(&encrypted.nonce);
        let plaintext_bytes = cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|_| {
                KeystoreError::DecryptionFailed(
                    "wrong passphrase or corrupted ciphertext".into(),
                )
            })?;
        let plaintext = String::from_utf8(plaintext_bytes)
            .map_err(|_| KeystoreError::DecryptionFailed("invalid UTF-8 after decryption".into()))?;
        Ok(SecretString::from(plaintext))
    }
}

/// Errors from keystore operations.
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("malformed encrypted key: {0}")]
    Malformed(String),
}

/// Derive a 32-byte AES key from a passphrase using iterated SHA-256.
///
/// 100,000 rounds slow down brute force; a fixed project salt prevents
/// rainbow-table reuse across applications.
fn derive_key(passphrase: &str) -> [u8; 32] {
    let salt = b"meshlink-keystore-v1-salt";
    let mut hash = Sha256::new();
    hash.update(salt);
    hash.update(passphrase.as_bytes());
    let mut result = hash.finalize();

    for _ in 0..KEY_DERIVATION_ROUNDS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(passphrase.as_bytes());
        result = h.finalize();
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}

/// Generate a cryptographically random 12-byte nonce for AES-GCM.
fn generate_nonce() -> [u8; NONCE_LEN] {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce);
    nonce
}
