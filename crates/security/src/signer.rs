//! Outbound frame signing.
//!
//! The signing key lives wrapped in [`secrecy::SecretString`]; an actual
//! `PrivateKeySigner` is materialized for the duration of one signing call
//! and dropped immediately after, so plaintext key material never outlives
//! the operation that needed it.

use std::str::FromStr;

use alloy::hex;
use alloy::primitives::Address;
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use secrecy::{ExposeSecret, SecretString};

use meshlink_core::error::{Result, SignatureError};
use meshlink_core::frame::Frame;

use crate::verify::canonical_content;

/// Holder of the client's signing identity.
pub struct FrameSigner {
    key: SecretString,
    address: Address,
}

impl FrameSigner {
    /// Build a signer from a hex-encoded secp256k1 private key
    /// (with or without the `0x` prefix). The wallet address is derived
    /// once; the key itself is kept wrapped.
    pub fn from_hex(key: &str) -> Result<Self> {
        let trimmed = key.trim();
        let signer = PrivateKeySigner::from_str(trimmed)
            .map_err(|e| SignatureError::SigningFailed(format!("invalid private key: {e}")))?;
        let address = signer.address();
        drop(signer);
        Ok(Self {
            key: SecretString::from(trimmed.to_string()),
            address,
        })
    }

    /// The EIP-55 checksummed wallet address derived from the key.
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Whether `other` names this signer's address (case-insensitive).
    pub fn is_own_address(&self, other: &str) -> bool {
        Address::from_str(&other.trim().to_lowercase())
            .map(|parsed| parsed == self.address)
            .unwrap_or(false)
    }

    /// Sign raw bytes under the Ethereum personal-message prefix.
    /// Returns the 65-byte recoverable signature as 0x-prefixed hex.
    pub fn sign_message(&self, message: &[u8]) -> Result<String> {
        let signer = PrivateKeySigner::from_str(self.key.expose_secret())
            .map_err(|e| SignatureError::SigningFailed(format!("invalid private key: {e}")))?;
        let signature = signer
            .sign_message_sync(message)
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// Sign a frame's canonical content and attach `signature` and
    /// `public_key` to it.
    pub fn sign_frame(&self, frame: &mut Frame) -> Result<()> {
        // Any stale attribution would end up inside the signed content.
        frame.signature = None;
        frame.public_key = None;
        let canonical = canonical_content(frame)?;
        let signature = self.sign_message(canonical.as_bytes())?;
        frame.signature = Some(signature);
        frame.public_key = Some(self.address());
        Ok(())
    }
}

impl std::fmt::Debug for FrameSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSigner")
            .field("key", &"[REDACTED]")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known dev-chain key 0 — never holds real funds.
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn derives_expected_address() {
        let signer = FrameSigner::from_hex(TEST_KEY).unwrap();
        assert_eq!(signer.address(), TEST_ADDRESS);
    }

    #[test]
    fn address_comparison_ignores_case() {
        let signer = FrameSigner::from_hex(TEST_KEY).unwrap();
        assert!(signer.is_own_address(&TEST_ADDRESS.to_lowercase()));
        assert!(signer.is_own_address(&TEST_ADDRESS.to_uppercase().replace("0X", "0x")));
        assert!(!signer.is_own_address("0x0000000000000000000000000000000000000001"));
    }

    #[test]
    fn rejects_garbage_key() {
        assert!(FrameSigner::from_hex("0xnotakey").is_err());
        assert!(FrameSigner::from_hex("").is_err());
    }

    #[test]
    fn signature_is_65_byte_hex() {
        let signer = FrameSigner::from_hex(TEST_KEY).unwrap();
        let sig = signer.sign_message(b"challenge-text").unwrap();
        assert!(sig.starts_with("0x"));
        assert_eq!(sig.len(), 2 + 65 * 2);
    }

    #[test]
    fn debug_never_prints_key_material() {
        let signer = FrameSigner::from_hex(TEST_KEY).unwrap();
        let debug = format!("{signer:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("ac0974be"));
    }

    #[test]
    fn sign_frame_attaches_signature_and_address() {
        let signer = FrameSigner::from_hex(TEST_KEY).unwrap();
        let mut frame = Frame::message("hello").with_to("0xabc");
        signer.sign_frame(&mut frame).unwrap();
        assert!(frame.signature.is_some());
        assert_eq!(frame.public_key.as_deref(), Some(TEST_ADDRESS));
    }
}
