//! Fingerprint block/favorite marks.
//!
//! Kept apart from the contact table: a mark targets an identity, not a
//! contact record, so it applies to peers that were never added and
//! survives ephemeral-address rotation. The type only accepts
//! [`Fingerprint`]s; no code path can record a transient address here.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::identity::Fingerprint;
use crate::storage::Database;

/// Durable block/favorite marks keyed by fingerprint.
#[derive(Clone)]
pub struct Blocklist {
    db: Arc<Mutex<Database>>,
}

impl Blocklist {
    /// Create a blocklist over a shared database handle.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Block an identity.
    pub async fn block(&self, fp: &Fingerprint) -> Result<()> {
        self.db.lock().await.set_block_mark(fp, true)
    }

    /// Unblock an identity.
    pub async fn unblock(&self, fp: &Fingerprint) -> Result<()> {
        self.db.lock().await.set_block_mark(fp, false)
    }

    /// Whether an identity is blocked.
    pub async fn is_blocked(&self, fp: &Fingerprint) -> Result<bool> {
        self.db.lock().await.is_fingerprint_blocked(fp)
    }

    /// Mark an identity as favorite.
    pub async fn favorite(&self, fp: &Fingerprint) -> Result<()> {
        self.db.lock().await.set_favorite_mark(fp, true)
    }

    /// Clear the favorite mark.
    pub async fn unfavorite(&self, fp: &Fingerprint) -> Result<()> {
        self.db.lock().await.set_favorite_mark(fp, false)
    }

    /// Whether an identity is a favorite.
    pub async fn is_favorite(&self, fp: &Fingerprint) -> Result<bool> {
        self.db.lock().await.is_fingerprint_favorite(fp)
    }

    /// All blocked fingerprints.
    pub async fn all_blocked(&self) -> Result<Vec<Fingerprint>> {
        self.db.lock().await.blocked_fingerprints()
    }

    /// All favorite fingerprints.
    pub async fn all_favorites(&self) -> Result<Vec<Fingerprint>> {
        self.db.lock().await.favorite_fingerprints()
    }
}
