//! # BitChat Core Library
//!
//! A privacy-first peer-to-peer messenger core for unreliable and hostile
//! network environments. Peers form an ad-hoc mesh over local radios
//! (Bluetooth LE and WiFi-Direct) and fall back to a relay overlay when
//! out of radio range.
//!
//! ## Security Model
//!
//! BitChat assumes a hostile environment with:
//! - Network observers (ISPs, state-level actors)
//! - Compromised or confiscated devices
//! - Malicious relay operators
//!
//! ## Core Guarantees
//!
//! - Identities are long-lived key pairs; no accounts, emails, or phones
//! - End-to-end encryption via Noise sessions (handshake engine external)
//! - Persistence is opt-in and fully encrypted at rest
//! - A rapid panic wipe destroys all durable state
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Application / UI             │
//! ├─────────────────────────────────────────────┤
//! │   chat (engine, pipeline)  │   contacts     │
//! ├─────────────────────────────────────────────┤
//! │   storage (encrypted db, keystore)  │ wipe  │
//! ├─────────────────────────────────────────────┤
//! │   transport (router)  │  identity (codec)   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The Noise handshake engine, the BLE/WiFi-Direct stacks, and the relay
//! overlay are external collaborators reached through the seams in
//! [`transport`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod chat;
pub mod config;
pub mod contacts;
pub mod error;
pub mod identity;
pub mod logging;
pub mod storage;
pub mod transport;
pub mod wipe;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default per-conversation message cap for the durable store.
pub const MESSAGE_CAP: usize = 1000;

/// Default message retention window in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Maximum message content size in bytes (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 65536;
