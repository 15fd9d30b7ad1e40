//! Encrypted local storage for BitChat.
//!
//! All durable data lives in one SQLCipher database encrypted with a
//! key from the [`keystore`]. Persistence is opt-in: the message store
//! drops writes and returns empty reads until the user enables it.
//!
//! ## Storage Rules
//!
//! - No plaintext message content on disk, ever
//! - WAL mode disabled to prevent plaintext journal leakage
//! - Key material zeroized after use
//! - The panic wipe may delete the database out from under open handles

mod database;
mod messages;
pub mod keystore;
mod schema;

pub use database::{Database, DatabaseConfig};
pub use keystore::{EncryptedDbKeystore, MachineEnclave, SecureEnclave};
pub use messages::MessageStore;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "bitchat.db";

/// Sibling files SQLite may create next to the database.
pub const DB_SIBLING_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];
