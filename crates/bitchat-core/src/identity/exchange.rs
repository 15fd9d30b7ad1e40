//! Contact exchange payload.
//!
//! The compact record shared via QR or in-band when two users add each
//! other: `{v:1, n:<nickname>, npk:<hex32>, spk?:<hex32>}`. Parsing
//! fails closed: wrong version, empty nickname, wrong hex length, or
//! any non-lowercase-hex character rejects the whole payload.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported exchange payload version.
pub const EXCHANGE_VERSION: u8 = 1;

/// A contact exchange record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactExchange {
    /// Payload version; must be [`EXCHANGE_VERSION`].
    pub v: u8,
    /// Self-announced display name (non-empty UTF-8).
    pub n: String,
    /// Noise static public key, 64 lowercase hex chars.
    pub npk: String,
    /// Optional signing public key, 64 lowercase hex chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spk: Option<String>,
}

impl ContactExchange {
    /// Build a record for our own identity.
    pub fn new(display_name: impl Into<String>, noise_public: &[u8; 32]) -> Self {
        Self {
            v: EXCHANGE_VERSION,
            n: display_name.into(),
            npk: hex::encode(noise_public),
            spk: None,
        }
    }

    /// Attach the signing public key.
    pub fn with_signing_key(mut self, signing_public: &[u8; 32]) -> Self {
        self.spk = Some(hex::encode(signing_public));
        self
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Parse and validate a received payload. Fails closed on any
    /// malformed field.
    pub fn decode(payload: &str) -> Result<Self> {
        let record: ContactExchange = serde_json::from_str(payload)
            .map_err(|_| Error::InvalidInput("malformed exchange payload".into()))?;
        record.validate()?;
        Ok(record)
    }

    /// The Noise static public key as bytes.
    pub fn noise_public(&self) -> Result<[u8; 32]> {
        decode_key_hex(&self.npk)
    }

    /// The signing public key as bytes, if present.
    pub fn signing_public(&self) -> Result<Option<[u8; 32]>> {
        self.spk.as_deref().map(decode_key_hex).transpose()
    }

    fn validate(&self) -> Result<()> {
        if self.v != EXCHANGE_VERSION {
            return Err(Error::InvalidInput("unsupported exchange version".into()));
        }
        if self.n.trim().is_empty() {
            return Err(Error::InvalidInput("empty nickname".into()));
        }
        if !is_key_hex(&self.npk) {
            return Err(Error::InvalidInput("malformed noise public key".into()));
        }
        if let Some(spk) = &self.spk {
            if !is_key_hex(spk) {
                return Err(Error::InvalidInput("malformed signing key".into()));
            }
        }
        Ok(())
    }
}

/// 64 chars, lowercase hex only.
fn is_key_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn decode_key_hex(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| Error::Encoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::Encoding("key must be 32 bytes".into()))
}
