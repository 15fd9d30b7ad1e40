//! Hash ID derivation and QR URI codec.
//!
//! A Hash ID is the user-facing 8-character code for an identity: the
//! first 40 bits of SHA-256 of the 32-byte public key, re-encoded at 5
//! bits per symbol over an alphabet that omits the easily-confused
//! characters `0 O 1 I L`. The QR URI form adds a 2-symbol checksum so
//! hand-typed or scanned codes fail closed on corruption.
//!
//! This module is pure and must stay byte-exact: QR codes round-trip
//! across independent implementations.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The Hash ID alphabet. Omits `0`, `O`, `1`, `I`, `L`.
pub const HASH_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Length of a Hash ID in characters.
pub const HASH_ID_LEN: usize = 8;

/// Length of the QR checksum in characters.
pub const CHECKSUM_LEN: usize = 2;

/// URI scheme prefix for contact-add QR codes.
pub const QR_PREFIX: &str = "bitchat://add/";

/// Derive the 8-character Hash ID from a 32-byte public key.
///
/// The first 5 bytes of SHA-256(pk) are read as a big-endian 40-bit
/// value and split into eight 5-bit groups, high bits first. Each group
/// indexes the alphabet modulo its length.
pub fn hash_id(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);

    let mut bits: u64 = 0;
    for byte in &digest[..5] {
        bits = (bits << 8) | u64::from(*byte);
    }

    let mut out = String::with_capacity(HASH_ID_LEN);
    for i in 0..HASH_ID_LEN {
        let group = ((bits >> (35 - 5 * i)) & 0x1f) as usize;
        out.push(HASH_ALPHABET[group % HASH_ALPHABET.len()] as char);
    }
    out
}

/// Check whether a string is a well-formed Hash ID: exactly 8 symbols,
/// all from the alphabet.
pub fn is_valid_hash_id(s: &str) -> bool {
    s.len() == HASH_ID_LEN && s.bytes().all(|b| HASH_ALPHABET.contains(&b))
}

/// Two-symbol checksum over a Hash ID: the first byte of
/// SHA-256(ASCII hash id), high symbol `byte >> 5`, low symbol
/// `byte & 31`, both modulo the alphabet length.
fn checksum(hash: &str) -> String {
    let byte = Sha256::digest(hash.as_bytes())[0] as usize;
    let hi = HASH_ALPHABET[(byte >> 5) % HASH_ALPHABET.len()] as char;
    let lo = HASH_ALPHABET[(byte & 0x1f) % HASH_ALPHABET.len()] as char;
    let mut out = String::with_capacity(CHECKSUM_LEN);
    out.push(hi);
    out.push(lo);
    out
}

/// Build the contact-add QR URI for a public key:
/// `bitchat://add/<HASHID>/<CHK>`.
pub fn qr_uri(public_key: &[u8; 32]) -> String {
    let hash = hash_id(public_key);
    let chk = checksum(&hash);
    format!("{QR_PREFIX}{hash}/{chk}")
}

/// Parse a contact-add QR URI, returning the Hash ID.
///
/// Rejects any URI that does not match the exact shape
/// (`InvalidInput`) or whose checksum does not recompute
/// (`InvalidInput` as well; the distinction is logged, never surfaced,
/// to keep scanner feedback uniform).
pub fn parse_qr_uri(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix(QR_PREFIX)
        .ok_or_else(|| Error::InvalidInput("malformed QR URI".into()))?;

    let (hash, chk) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidInput("malformed QR URI".into()))?;

    if !is_valid_hash_id(hash) {
        return Err(Error::InvalidInput("malformed QR URI".into()));
    }
    if chk.len() != CHECKSUM_LEN || !chk.bytes().all(|b| HASH_ALPHABET.contains(&b)) {
        return Err(Error::InvalidInput("malformed QR URI".into()));
    }

    if chk != checksum(hash) {
        return Err(Error::InvalidInput("QR checksum mismatch".into()));
    }

    Ok(hash.to_string())
}
