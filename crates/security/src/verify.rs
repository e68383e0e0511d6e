//! Inbound frame signature verification.
//!
//! The canonical signable content is the frame with `signature`,
//! `public_key`, and `id` removed, absent fields dropped, serialized with
//! lexicographically sorted keys (serde_json's default map ordering).
//! Hashing and recovery follow the Ethereum personal-message rule.

use std::collections::HashSet;
use std::str::FromStr;

use alloy::primitives::{Address, Signature};

use meshlink_core::error::{Result, SignatureError};
use meshlink_core::frame::{Frame, FrameKind};

/// Verifier tuning.
#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    /// Accepted signer addresses; empty means allow-all.
    pub trusted_addresses: Vec<String>,
    /// Frame kinds that must carry a signature.
    pub require_for: Vec<FrameKind>,
    /// When set, every frame must carry a signature.
    pub strict_mode: bool,
}

/// Outcome of one verification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    /// The frame carried no signature at all.
    pub missing: bool,
    /// Recovered signer address (checksummed), when recovery ran.
    pub recovered: Option<String>,
    /// Whether the recovered signer passes the whitelist (true when the
    /// whitelist is empty).
    pub is_trusted: bool,
    /// Populated when `valid` is false.
    pub reason: Option<String>,
}

impl Verification {
    fn ok(recovered: Option<String>, is_trusted: bool, missing: bool) -> Self {
        Self {
            valid: true,
            missing,
            recovered,
            is_trusted,
            reason: None,
        }
    }

    fn fail(missing: bool, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            missing,
            recovered: None,
            is_trusted: false,
            reason: Some(reason.into()),
        }
    }

    /// Convert a failed verification into the error it represents.
    pub fn as_error(&self, kind: FrameKind) -> Option<SignatureError> {
        if self.valid {
            return None;
        }
        let reason = self.reason.clone().unwrap_or_default();
        Some(if self.missing {
            SignatureError::Missing {
                kind: kind.to_string(),
            }
        } else if reason.contains("whitelist") {
            SignatureError::Untrusted {
                recovered: self.recovered.clone().unwrap_or_default(),
            }
        } else if reason.contains("no address") {
            SignatureError::NoAddress
        } else if reason.contains("does not match") {
            SignatureError::Mismatch {
                declared: String::new(),
                recovered: self.recovered.clone().unwrap_or_default(),
            }
        } else {
            SignatureError::Malformed(reason)
        })
    }
}

/// Build the canonical signable content for a frame.
pub fn canonical_content(frame: &Frame) -> Result<String> {
    let mut value = serde_json::to_value(frame)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signature");
        obj.remove("public_key");
        obj.remove("id");
    }
    Ok(serde_json::to_string(&value)?)
}

/// ECDSA-over-keccak frame verifier with an optional trust whitelist.
pub struct SignatureVerifier {
    trusted: HashSet<Address>,
    require_for: HashSet<FrameKind>,
    strict_mode: bool,
}

impl SignatureVerifier {
    /// Build a verifier; trusted addresses are parsed case-insensitively
    /// and invalid entries are rejected up front.
    pub fn new(config: VerifierConfig) -> Result<Self> {
        let mut trusted = HashSet::with_capacity(config.trusted_addresses.len());
        for entry in &config.trusted_addresses {
            let address = Address::from_str(&entry.trim().to_lowercase()).map_err(|e| {
                meshlink_core::Error::Config(format!("invalid trusted address {entry:?}: {e}"))
            })?;
            trusted.insert(address);
        }
        Ok(Self {
            trusted,
            require_for: config.require_for.into_iter().collect(),
            strict_mode: config.strict_mode,
        })
    }

    /// Verify one frame. Never errors: the outcome (including malformed
    /// input) is encoded in the returned [`Verification`].
    pub fn verify(&self, frame: &Frame) -> Verification {
        let Some(signature_hex) = frame.signature.as_deref() else {
            let required = self.strict_mode || self.require_for.contains(&frame.kind);
            if required {
                return Verification::fail(
                    true,
                    format!("signature missing on {} frame that requires one", frame.kind),
                );
            }
            return Verification::ok(None, self.trusted.is_empty(), true);
        };

        let canonical = match canonical_content(frame) {
            Ok(canonical) => canonical,
            Err(e) => return Verification::fail(false, format!("canonicalization failed: {e}")),
        };

        // Resolve the address the frame claims to be signed by.
        let declared = match frame.public_key.as_deref() {
            Some(address) => address,
            None => match frame.from.as_deref() {
                Some(from) if looks_like_address(from) => from,
                _ => return Verification::fail(false, "no address available for verification"),
            },
        };
        let declared_address = match Address::from_str(&declared.trim().to_lowercase()) {
            Ok(address) => address,
            Err(e) => {
                return Verification::fail(false, format!("declared address unparseable: {e}"));
            }
        };

        let signature = match Signature::from_str(signature_hex) {
            Ok(signature) => signature,
            Err(e) => return Verification::fail(false, format!("signature unparseable: {e}")),
        };
        let recovered = match signature.recover_address_from_msg(canonical.as_bytes()) {
            Ok(address) => address,
            Err(e) => return Verification::fail(false, format!("recovery failed: {e}")),
        };

        if recovered != declared_address {
            tracing::debug!(
                declared = %declared_address,
                recovered = %recovered,
                kind = %frame.kind,
                "signature does not match declared address"
            );
            let mut failure = Verification::fail(
                false,
                format!("signature does not match declared address {declared_address}"),
            );
            failure.recovered = Some(recovered.to_string());
            return failure;
        }

        if !self.trusted.is_empty() && !self.trusted.contains(&recovered) {
            let mut failure =
                Verification::fail(false, format!("signer {recovered} not in trusted whitelist"));
            failure.recovered = Some(recovered.to_string());
            return failure;
        }

        Verification::ok(Some(recovered.to_string()), true, false)
    }
}

fn looks_like_address(s: &str) -> bool {
    let s = s.trim();
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::FrameSigner;
    use serde_json::json;

    const KEY_1: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_2: &str = "0x8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba";

    fn task_response() -> Frame {
        Frame::new(FrameKind::TaskResponse)
            .with_id("T1")
            .with_data(json!({"task_id": "1", "success": true}))
    }

    fn verifier(config: VerifierConfig) -> SignatureVerifier {
        SignatureVerifier::new(config).unwrap()
    }

    #[test]
    fn canonical_strips_signature_public_key_and_id() {
        let mut frame = task_response();
        frame.signature = Some("0xdead".into());
        frame.public_key = Some("0xbeef".into());
        let canonical = canonical_content(&frame).unwrap();
        assert!(!canonical.contains("signature"));
        assert!(!canonical.contains("public_key"));
        assert!(!canonical.contains("\"id\""));
        assert!(!canonical.contains("null"), "absent fields must be dropped");
    }

    #[test]
    fn canonical_keys_are_sorted() {
        let frame = Frame::message("x").with_room("r").with_to("t");
        let canonical = canonical_content(&frame).unwrap();
        let content_pos = canonical.find("\"content\"").unwrap();
        let kind_pos = canonical.find("\"kind\"").unwrap();
        let room_pos = canonical.find("\"room\"").unwrap();
        let to_pos = canonical.find("\"to\"").unwrap();
        assert!(content_pos < kind_pos && kind_pos < room_pos && room_pos < to_pos);
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        signer.sign_frame(&mut frame).unwrap();

        let verification = verifier(VerifierConfig::default()).verify(&frame);
        assert!(verification.valid, "{:?}", verification.reason);
        assert!(!verification.missing);
        assert_eq!(verification.recovered.as_deref(), Some(signer.address().as_str()));
        assert!(verification.is_trusted);
    }

    #[test]
    fn wrong_signer_detected() {
        let signer_2 = FrameSigner::from_hex(KEY_2).unwrap();
        let signer_1 = FrameSigner::from_hex(KEY_1).unwrap();

        // Signed by key 2 but declaring key 1's address.
        let mut frame = task_response();
        signer_2.sign_frame(&mut frame).unwrap();
        frame.public_key = Some(signer_1.address());

        let verification = verifier(VerifierConfig {
            require_for: vec![FrameKind::TaskResponse],
            ..VerifierConfig::default()
        })
        .verify(&frame);
        assert!(!verification.valid);
        assert!(verification.reason.as_deref().unwrap().contains("does not match"));
        assert!(matches!(
            verification.as_error(FrameKind::TaskResponse),
            Some(SignatureError::Mismatch { .. })
        ));
    }

    #[test]
    fn missing_signature_allowed_by_default() {
        let verification = verifier(VerifierConfig::default()).verify(&task_response());
        assert!(verification.valid);
        assert!(verification.missing);
    }

    #[test]
    fn missing_signature_rejected_when_required() {
        let verification = verifier(VerifierConfig {
            require_for: vec![FrameKind::TaskResponse],
            ..VerifierConfig::default()
        })
        .verify(&task_response());
        assert!(!verification.valid);
        assert!(verification.missing);

        let strict = verifier(VerifierConfig {
            strict_mode: true,
            ..VerifierConfig::default()
        })
        .verify(&Frame::message("hi"));
        assert!(!strict.valid);
    }

    #[test]
    fn whitelist_rejects_unknown_signer() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        signer.sign_frame(&mut frame).unwrap();

        let other = "0x9965507D1a55bcC2695C58ba16FB37d819B0A4dc";
        let verification = verifier(VerifierConfig {
            trusted_addresses: vec![other.into()],
            ..VerifierConfig::default()
        })
        .verify(&frame);
        assert!(!verification.valid);
        assert!(verification.reason.as_deref().unwrap().contains("whitelist"));
    }

    #[test]
    fn whitelist_is_case_insensitive() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        signer.sign_frame(&mut frame).unwrap();

        let verification = verifier(VerifierConfig {
            trusted_addresses: vec![signer.address().to_uppercase().replace("0X", "0x")],
            ..VerifierConfig::default()
        })
        .verify(&frame);
        assert!(verification.valid, "{:?}", verification.reason);
    }

    #[test]
    fn falls_back_to_from_address() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        frame.from = Some(signer.address());
        signer.sign_frame(&mut frame).unwrap();
        frame.public_key = None;

        let verification = verifier(VerifierConfig::default()).verify(&frame);
        assert!(verification.valid, "{:?}", verification.reason);
    }

    #[test]
    fn no_address_available() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        frame.from = Some("not-an-address".into());
        signer.sign_frame(&mut frame).unwrap();
        frame.public_key = None;

        let verification = verifier(VerifierConfig::default()).verify(&frame);
        assert!(!verification.valid);
        assert!(verification.reason.as_deref().unwrap().contains("no address"));
    }

    #[test]
    fn tampered_content_breaks_signature() {
        let signer = FrameSigner::from_hex(KEY_1).unwrap();
        let mut frame = task_response();
        signer.sign_frame(&mut frame).unwrap();
        frame.data = Some(json!({"task_id": "1", "success": false}));

        let verification = verifier(VerifierConfig::default()).verify(&frame);
        assert!(!verification.valid);
    }

    #[test]
    fn invalid_trusted_address_rejected_at_construction() {
        let result = SignatureVerifier::new(VerifierConfig {
            trusted_addresses: vec!["nope".into()],
            ..VerifierConfig::default()
        });
        assert!(result.is_err());
    }
}
