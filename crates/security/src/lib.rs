//! Security module for meshlink — signatures, SSRF validation, and key storage.
//!
//! Provides:
//! - **Signer**: scoped-use frame signing with a wrapped secp256k1 key
//! - **Verify**: ECDSA-over-keccak verification of inbound frames
//! - **SSRF**: webhook target validation against internal address space
//! - **Secrets**: encrypt/decrypt the signing key at rest

pub mod secrets;
pub mod signer;
pub mod ssrf;
pub mod verify;

pub use secrets::{EncryptedKey, Keystore, KeystoreError};
pub use signer::FrameSigner;
pub use ssrf::validate_webhook_url;
pub use verify::{SignatureVerifier, Verification, VerifierConfig, canonical_content};
