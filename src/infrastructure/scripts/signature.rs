//! Script signature verification
//!
//! A signed script carries `// sign <hex>` as its very first line; the
//! ed25519 signature covers every byte after that line. Verification only
//! classifies trust; third-party scripts load regardless of the outcome.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::application::errors::ScriptError;

static SIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^//\s*sign\s+([0-9a-fA-F]+)\s*$").expect("valid regex"));

/// Trust classification of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Signature present but invalid
    Error,
    /// No signature line, or no public key configured
    Unknown,
    /// Signature verified against the trusted key
    Official,
}

/// Classifies scripts against a single trusted public key
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    key: Option<VerifyingKey>,
}

impl SignatureVerifier {
    pub fn new(key: Option<VerifyingKey>) -> Self {
        Self { key }
    }

    /// Build from a hex-encoded 32-byte ed25519 public key
    pub fn from_hex(key_hex: &str) -> Result<Self, ScriptError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| ScriptError::Signature(format!("bad public key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| {
                ScriptError::Signature(format!("public key must be 32 bytes, got {}", v.len()))
            })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ScriptError::Signature(format!("bad public key: {e}")))?;
        Ok(Self { key: Some(key) })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Classify raw script bytes
    pub fn classify(&self, raw: &[u8]) -> TrustLevel {
        let Some(key) = &self.key else {
            return TrustLevel::Unknown;
        };
        if raw.is_empty() {
            return TrustLevel::Unknown;
        }
        let Some(newline) = raw.iter().position(|&b| b == b'\n') else {
            return TrustLevel::Unknown;
        };
        let first_line = String::from_utf8_lossy(&raw[..newline]);
        let Some(caps) = SIGN_RE.captures(first_line.trim_end_matches('\r')) else {
            return TrustLevel::Unknown;
        };
        let Ok(sig_bytes) = hex::decode(&caps[1]) else {
            return TrustLevel::Error;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return TrustLevel::Error;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        let body = &raw[newline + 1..];
        if key.verify(body, &signature).is_ok() {
            TrustLevel::Official
        } else {
            TrustLevel::Error
        }
    }
}
