//! Identity management for BitChat.
//!
//! An identity is a long-lived asymmetric key pair; the 32-byte static
//! public key IS the identity. There are no usernames, emails, phone
//! numbers, or recovery mechanisms. Two derived forms exist:
//!
//! - **Fingerprint** — lowercase-hex SHA-256 of the public key; the
//!   durable identifier used for blocks and favorites.
//! - **Hash ID** — an 8-character human-shareable code derived from the
//!   first 40 bits of SHA-256 of the public key (see [`codec`]).
//!
//! A **peer address** is the ephemeral transport-level identifier (BLE
//! fingerprint, WiFi MAC, or a Nostr temp key) and may change across
//! reconnects. The fingerprint is always durable; the peer address
//! never is.
//!
//! ## Security
//!
//! - Secret keys are zeroized on drop
//! - No identity recovery mechanism
//! - Fingerprints enable out-of-band verification

pub mod codec;
pub mod exchange;

use std::fmt;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Prefix used for temporary relay-origin conversation keys.
pub const NOSTR_TEMP_PREFIX: &str = "nostr_";

/// Length of the truncated public-key hex in a Nostr temp key.
pub const NOSTR_TEMP_HEX_LEN: usize = 16;

/// An ephemeral transport-level peer identifier.
///
/// Lexicographic ordering is part of the mesh protocol: the smaller of
/// two peer addresses is the authoritative handshake initiator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Wrap a raw transport address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The raw address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the temporary address used for relay-origin conversations,
    /// keyed by a truncated public-key hex.
    pub fn nostr_temp(public_key_hex: &str) -> Self {
        let prefix: String = public_key_hex
            .chars()
            .take(NOSTR_TEMP_HEX_LEN)
            .collect();
        Self(format!("{NOSTR_TEMP_PREFIX}{prefix}"))
    }

    /// If this is a Nostr temp address, return the truncated
    /// public-key-hex portion.
    pub fn nostr_temp_key(&self) -> Option<&str> {
        self.0
            .strip_prefix(NOSTR_TEMP_PREFIX)
            .filter(|rest| rest.len() == NOSTR_TEMP_HEX_LEN)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lowercase-hex SHA-256 of a public key; the stable durable identifier
/// for block and favorite lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a 32-byte public key.
    pub fn of(public_key: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse from a lowercase-hex string (64 chars).
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidInput("malformed fingerprint".into()));
        }
        Ok(Self(s.to_string()))
    }

    /// The hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format for human-readable display: groups of 4 characters for
    /// easier verbal comparison.
    pub fn display_groups(&self) -> String {
        self.0
            .as_bytes()
            .chunks(4)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A long-lived BitChat identity.
///
/// Holds the Noise static key pair (X25519) used for end-to-end
/// sessions and an Ed25519 signing key pair for announcements. Secret
/// material is zeroized on drop by the underlying key types.
pub struct BitchatIdentity {
    noise_secret: StaticSecret,
    noise_public: PublicKey,
    signing_key: SigningKey,
}

impl BitchatIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let noise_secret = StaticSecret::random_from_rng(OsRng);
        let noise_public = PublicKey::from(&noise_secret);
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            noise_secret,
            noise_public,
            signing_key,
        }
    }

    /// Restore an identity from stored secret bytes.
    pub fn from_secret_bytes(noise_secret: [u8; 32], signing_secret: [u8; 32]) -> Self {
        let noise_secret = StaticSecret::from(noise_secret);
        let noise_public = PublicKey::from(&noise_secret);
        let signing_key = SigningKey::from_bytes(&signing_secret);
        Self {
            noise_secret,
            noise_public,
            signing_key,
        }
    }

    /// The 32-byte Noise static public key. This IS the identity.
    pub fn public_key(&self) -> [u8; 32] {
        *self.noise_public.as_bytes()
    }

    /// The Ed25519 signing public key.
    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret bytes for storage: (noise static secret, signing secret).
    pub fn secret_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.noise_secret.to_bytes(), self.signing_key.to_bytes())
    }

    /// Durable fingerprint of this identity.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public_key())
    }

    /// Human-shareable Hash ID of this identity.
    pub fn hash_id(&self) -> String {
        codec::hash_id(&self.public_key())
    }
}

impl fmt::Debug for BitchatIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitchatIdentity({})", self.hash_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        let identity = BitchatIdentity::generate();

        assert_eq!(identity.fingerprint().as_str().len(), 64);
        assert_eq!(identity.hash_id().len(), 8);
    }

    #[test]
    fn test_identity_persistence() {
        let id1 = BitchatIdentity::generate();
        let (noise, signing) = id1.secret_bytes();

        let id2 = BitchatIdentity::from_secret_bytes(noise, signing);

        assert_eq!(id1.public_key(), id2.public_key());
        assert_eq!(id1.fingerprint(), id2.fingerprint());
        assert_eq!(id1.hash_id(), id2.hash_id());
    }

    #[test]
    fn test_fingerprint_validation() {
        let fp = Fingerprint::of(&[0u8; 32]);
        assert!(Fingerprint::from_hex(fp.as_str()).is_ok());

        assert!(Fingerprint::from_hex("abc").is_err());
        assert!(Fingerprint::from_hex(&"A".repeat(64)).is_err());
    }

    #[test]
    fn test_fingerprint_display_groups() {
        let fp = Fingerprint::of(&[7u8; 32]);
        let grouped = fp.display_groups();
        assert_eq!(grouped.split(' ').count(), 16);
    }

    #[test]
    fn test_nostr_temp_addresses() {
        let addr = PeerAddress::nostr_temp(&"ab".repeat(32));
        assert_eq!(addr.as_str(), "nostr_abababababababab");
        assert_eq!(addr.nostr_temp_key(), Some("abababababababab"));

        let plain = PeerAddress::new("a1b2c3d4e5f60718");
        assert_eq!(plain.nostr_temp_key(), None);
    }

    #[test]
    fn test_peer_address_ordering() {
        // Lexicographic order decides the handshake initiator.
        let a = PeerAddress::new("0a");
        let b = PeerAddress::new("0b");
        assert!(a < b);
    }
}
