//! Logging utilities with automatic sensitive data redaction.
//!
//! Peer addresses, hash ids, and key material must never appear whole in
//! log output. These wrappers are used at `tracing` call sites so the
//! redaction is enforced by the type, not by reviewer discipline.

use std::fmt;

/// A wrapper that fully redacts a value when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a peer address, showing only the first and last 4 characters.
pub struct RedactedAddr<'a>(pub &'a str);

impl fmt::Display for RedactedAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED ADDR]")
        }
    }
}

impl fmt::Debug for RedactedAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a hex string (fingerprint, public key), showing 4+4 characters.
pub struct RedactedHex<'a>(pub &'a str);

impl fmt::Display for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED HEX]")
        }
    }
}

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Patterns that should be redacted from free-form log text.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "private",
    "key",
    "token",
    "credential",
];

/// Check if a string appears to contain sensitive data.
pub fn appears_sensitive(s: &str) -> bool {
    let lower = s.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitize a string for logging, redacting sensitive patterns.
pub fn sanitize_for_log(s: &str) -> String {
    if appears_sensitive(s) {
        "[REDACTED]".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        let secret = Redacted("my_secret_password");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_redacted_addr() {
        let addr = RedactedAddr("a1b2c3d4e5f60718");
        let shown = format!("{}", addr);
        assert!(shown.starts_with("a1b2"));
        assert!(shown.ends_with("0718"));
        assert!(shown.contains("..."));

        let short = RedactedAddr("abcd");
        assert_eq!(format!("{}", short), "[REDACTED ADDR]");
    }

    #[test]
    fn test_redacted_bytes() {
        let b = RedactedBytes(&[0u8; 32]);
        assert_eq!(format!("{}", b), "[32 bytes]");
    }

    #[test]
    fn test_sanitize_for_log() {
        assert_eq!(sanitize_for_log("hello"), "hello");
        assert_eq!(sanitize_for_log("password123"), "[REDACTED]");
        assert_eq!(sanitize_for_log("noise_private_key"), "[REDACTED]");
    }
}
