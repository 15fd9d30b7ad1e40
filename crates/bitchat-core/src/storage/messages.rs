//! Durable per-conversation message log.
//!
//! A thin async facade over the [`Database`]: every operation takes the
//! shared handle's lock and runs on the caller's I/O task. The
//! persistence toggle gates reads and writes; destructive cleanup
//! (deletes) bypasses the gate so disabling persistence can still purge
//! old data.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::chat::message::{DeliveryStatus, Message, MessageId};
use crate::config::Preferences;
use crate::error::Result;
use crate::identity::PeerAddress;
use crate::storage::Database;

/// Handle to the durable message log.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Database>>,
    prefs: Arc<RwLock<Preferences>>,
}

impl MessageStore {
    /// Create a store over a shared database handle.
    pub fn new(db: Arc<Mutex<Database>>, prefs: Arc<RwLock<Preferences>>) -> Self {
        Self { db, prefs }
    }

    async fn enabled(&self) -> bool {
        self.prefs.read().await.persistence_enabled
    }

    async fn cap(&self) -> usize {
        self.prefs.read().await.message_cap
    }

    /// Upsert a message, then enforce the conversation cap. No-op when
    /// persistence is disabled.
    pub async fn save(&self, peer: &PeerAddress, msg: &Message) -> Result<()> {
        if !self.enabled().await {
            return Ok(());
        }
        let cap = self.cap().await;
        self.db.lock().await.save_message(peer, msg, cap)
    }

    /// Upsert a batch in a single transaction. No-op when disabled.
    pub async fn save_batch(&self, peer: &PeerAddress, msgs: &[Message]) -> Result<()> {
        if !self.enabled().await {
            return Ok(());
        }
        let cap = self.cap().await;
        self.db.lock().await.save_batch(peer, msgs, cap)
    }

    /// Load a conversation in ascending timestamp order. Empty when
    /// persistence is disabled.
    pub async fn load(&self, peer: &PeerAddress) -> Result<Vec<Message>> {
        if !self.enabled().await {
            return Ok(Vec::new());
        }
        self.db.lock().await.load_messages(peer)
    }

    /// Load a page in descending timestamp order (infinite scroll).
    pub async fn load_paginated(
        &self,
        peer: &PeerAddress,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        if !self.enabled().await {
            return Ok(Vec::new());
        }
        self.db.lock().await.load_messages_page(peer, limit, offset)
    }

    /// Update a stored message's delivery status (monotone).
    pub async fn update_status(
        &self,
        id: &MessageId,
        peer: &PeerAddress,
        status: &DeliveryStatus,
    ) -> Result<()> {
        if !self.enabled().await {
            return Ok(());
        }
        self.db.lock().await.update_message_status(id, peer, status)
    }

    /// Delete one conversation, returning the number of messages
    /// removed. Runs even when persistence is disabled.
    pub async fn delete_conversation(&self, peer: &PeerAddress) -> Result<usize> {
        self.db.lock().await.delete_conversation(peer)
    }

    /// Delete every stored message. Runs even when persistence is
    /// disabled.
    pub async fn delete_all(&self) -> Result<usize> {
        self.db.lock().await.delete_all_messages()
    }

    /// Case-insensitive substring search over content.
    pub async fn search(
        &self,
        query: &str,
        peer: Option<&PeerAddress>,
    ) -> Result<Vec<Message>> {
        if !self.enabled().await {
            return Ok(Vec::new());
        }
        self.db.lock().await.search_messages(query, peer)
    }

    /// Delete messages older than `max_age`, globally.
    pub async fn apply_retention(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.num_milliseconds();
        self.db.lock().await.apply_retention(cutoff)
    }

    /// Number of stored messages for a conversation.
    pub async fn count(&self, peer: &PeerAddress) -> Result<usize> {
        if !self.enabled().await {
            return Ok(0);
        }
        self.db.lock().await.message_count(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DatabaseConfig;

    fn store(persistence_enabled: bool) -> MessageStore {
        let config = DatabaseConfig {
            path: String::new(),
            in_memory: true,
        };
        let db = Database::open(&config, &[0u8; 32]).expect("open");
        let prefs = Preferences {
            persistence_enabled,
            ..Preferences::default()
        };
        MessageStore::new(Arc::new(Mutex::new(db)), Arc::new(RwLock::new(prefs)))
    }

    #[tokio::test]
    async fn test_disabled_store_drops_writes_and_reads_empty() {
        let store = store(false);
        let peer = PeerAddress::new("p1");
        let msg = Message::outgoing_private("hi", "me", "Alice");

        store.save(&peer, &msg).await.expect("save is a no-op");
        assert!(store.load(&peer).await.expect("load").is_empty());
        assert_eq!(store.count(&peer).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_enabled_store_round_trip() {
        let store = store(true);
        let peer = PeerAddress::new("p1");
        let msg = Message::outgoing_private("hi", "me", "Alice");

        store.save(&peer, &msg).await.expect("save");
        let loaded = store.load(&peer).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], msg);
    }

    #[tokio::test]
    async fn test_save_twice_is_upsert() {
        let store = store(true);
        let peer = PeerAddress::new("p1");
        let msg = Message::outgoing_private("hi", "me", "Alice");

        store.save(&peer, &msg).await.expect("save");
        store.save(&peer, &msg).await.expect("save again");
        assert_eq!(store.count(&peer).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_delete_bypasses_gate() {
        let store = store(true);
        let peer = PeerAddress::new("p1");
        let msg = Message::outgoing_private("hi", "me", "Alice");
        store.save(&peer, &msg).await.expect("save");

        // Simulate toggling persistence off, then purging.
        store.prefs.write().await.persistence_enabled = false;
        assert_eq!(store.delete_all().await.expect("delete"), 1);
    }
}
