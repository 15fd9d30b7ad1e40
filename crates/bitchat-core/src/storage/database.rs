//! Encrypted database operations.
//!
//! One SQLCipher database holds the message log, the contact set, and
//! the fingerprint block/favorite marks. The encryption key comes from
//! the [`keystore`](super::keystore); it never touches disk in
//! plaintext.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use crate::chat::message::{DeliveryStatus, Message, MessageId};
use crate::contacts::{Contact, VerificationMethod};
use crate::error::{Error, Result};
use crate::identity::{Fingerprint, PeerAddress};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use an in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// Encrypted database handle.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create an encrypted database.
    pub fn open(config: &DatabaseConfig, encryption_key: &[u8]) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Persistence(format!("failed to create directory: {}", e)))?;
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Persistence(format!("failed to open database: {}", e)))?;

        // Set encryption key (SQLCipher)
        let key_hex = hex::encode(encryption_key);
        conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", key_hex))
            .map_err(|e| Error::Persistence(format!("failed to set encryption key: {}", e)))?;

        // Security settings
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA auto_vacuum = FULL;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Persistence(format!("failed to set security pragmas: {}", e)))?;

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(&CREATE_SCHEMA.replace('?', &SCHEMA_VERSION.to_string()))
            .map_err(|e| Error::Persistence(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Close the database. SQLite finalizes on drop.
    pub fn close(self) {
        drop(self.conn);
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Upsert a message by id, then enforce the per-conversation cap.
    pub fn save_message(&self, peer: &PeerAddress, msg: &Message, cap: usize) -> Result<()> {
        self.insert_message(peer, msg)?;
        self.enforce_cap(peer, cap)?;
        Ok(())
    }

    /// Upsert a batch of messages in a single transaction, then enforce
    /// the cap once.
    pub fn save_batch(&mut self, peer: &PeerAddress, msgs: &[Message], cap: usize) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        for msg in msgs {
            insert_message_stmt(&tx, peer, msg)?;
        }
        tx.commit().map_err(|e| Error::Persistence(e.to_string()))?;
        self.enforce_cap(peer, cap)?;
        Ok(())
    }

    fn insert_message(&self, peer: &PeerAddress, msg: &Message) -> Result<()> {
        insert_message_stmt(&self.conn, peer, msg)
    }

    /// Trim the oldest messages beyond `cap`, ties broken by id.
    fn enforce_cap(&self, peer: &PeerAddress, cap: usize) -> Result<()> {
        let count = self.message_count(peer)?;
        if count <= cap {
            return Ok(());
        }
        let excess = (count - cap) as i64;
        self.conn
            .execute(
                r#"
                DELETE FROM messages WHERE peer_address = ?1 AND id IN (
                    SELECT id FROM messages WHERE peer_address = ?1
                    ORDER BY timestamp_millis ASC, id ASC LIMIT ?2
                )
                "#,
                params![peer.as_str(), excess],
            )
            .map_err(|e| Error::Persistence(format!("failed to enforce cap: {}", e)))?;
        Ok(())
    }

    /// Number of stored messages for a conversation.
    pub fn message_count(&self, peer: &PeerAddress) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE peer_address = ?",
                params![peer.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(count as usize)
    }

    /// Load a conversation in ascending timestamp order.
    pub fn load_messages(&self, peer: &PeerAddress) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, sender, content, timestamp_millis, is_private,
                       delivery_status, recipient_nickname, sender_peer_address,
                       encrypted_blob
                FROM messages
                WHERE peer_address = ?
                ORDER BY timestamp_millis ASC, id ASC
                "#,
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let rows = stmt
            .query_map(params![peer.as_str()], row_to_message_parts)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        collect_messages(rows)
    }

    /// Load a page of a conversation in descending timestamp order, for
    /// infinite-scroll UIs.
    pub fn load_messages_page(
        &self,
        peer: &PeerAddress,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, sender, content, timestamp_millis, is_private,
                       delivery_status, recipient_nickname, sender_peer_address,
                       encrypted_blob
                FROM messages
                WHERE peer_address = ?
                ORDER BY timestamp_millis DESC, id DESC
                LIMIT ? OFFSET ?
                "#,
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![peer.as_str(), limit as i64, offset as i64],
                row_to_message_parts,
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;

        collect_messages(rows)
    }

    /// Update a message's delivery status under the monotone rule.
    /// Backward transitions are ignored, not errors.
    pub fn update_message_status(
        &self,
        id: &MessageId,
        peer: &PeerAddress,
        status: &DeliveryStatus,
    ) -> Result<()> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT delivery_status FROM messages WHERE id = ? AND peer_address = ?",
                params![id.as_str(), peer.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let Some(current) = current else {
            return Err(Error::NotFound("message".into()));
        };

        if !DeliveryStatus::decode(&current)?.allows(status) {
            return Ok(());
        }

        self.conn
            .execute(
                "UPDATE messages SET delivery_status = ? WHERE id = ? AND peer_address = ?",
                params![status.encode(), id.as_str(), peer.as_str()],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Delete a conversation, returning the number of rows removed.
    pub fn delete_conversation(&self, peer: &PeerAddress) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM messages WHERE peer_address = ?",
                params![peer.as_str()],
            )
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    /// Delete every stored message, returning the count.
    pub fn delete_all_messages(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM messages", [])
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    /// Case-insensitive substring search over message content,
    /// optionally restricted to one conversation.
    pub fn search_messages(
        &self,
        query: &str,
        peer: Option<&PeerAddress>,
    ) -> Result<Vec<Message>> {
        let sql_base = r#"
            SELECT id, sender, content, timestamp_millis, is_private,
                   delivery_status, recipient_nickname, sender_peer_address,
                   encrypted_blob
            FROM messages
            WHERE instr(lower(content), lower(?1)) > 0
        "#;

        let rows = match peer {
            Some(peer) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "{sql_base} AND peer_address = ?2 ORDER BY timestamp_millis ASC, id ASC"
                    ))
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                let rows = stmt
                    .query_map(params![query, peer.as_str()], row_to_message_parts)
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                collect_messages(rows)?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "{sql_base} ORDER BY timestamp_millis ASC, id ASC"
                    ))
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                let rows = stmt
                    .query_map(params![query], row_to_message_parts)
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                collect_messages(rows)?
            }
        };

        Ok(rows)
    }

    /// Delete messages older than the cutoff (Unix millis), globally.
    pub fn apply_retention(&self, cutoff_millis: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM messages WHERE timestamp_millis < ?",
                params![cutoff_millis],
            )
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    // ========================================================================
    // Contacts
    // ========================================================================

    /// Insert or replace a full contact row.
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        let groups_json = if contact.groups.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&contact.groups)
                    .map_err(|e| Error::Encoding(e.to_string()))?,
            )
        };

        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO contacts
                (hash_id, public_key_hex, signing_key_hex, display_name, custom_name,
                 trusted, blocked, favorite, groups_json, notes, verification_method,
                 added_at, last_seen_at, last_message_at, unread_count,
                 current_peer_address, connected, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    contact.hash_id,
                    contact.public_key_hex,
                    contact.signing_key_hex,
                    contact.display_name,
                    contact.custom_name,
                    contact.trusted as i32,
                    contact.blocked as i32,
                    contact.favorite as i32,
                    groups_json,
                    contact.notes,
                    contact.verification_method.map(|m| m.as_str()),
                    contact.added_at,
                    contact.last_seen_at,
                    contact.last_message_at,
                    contact.unread_count as i64,
                    contact.current_peer_address.as_ref().map(|a| a.as_str()),
                    contact.connected as i32,
                    contact.updated_at,
                ],
            )
            .map_err(|e| Error::Persistence(format!("failed to upsert contact: {}", e)))?;
        Ok(())
    }

    /// Fetch a contact by hash id.
    pub fn contact_by_hash(&self, hash_id: &str) -> Result<Option<Contact>> {
        self.contact_where("hash_id = ?", params![hash_id])
    }

    /// Fetch a contact by public-key hex.
    pub fn contact_by_public_key(&self, public_key_hex: &str) -> Result<Option<Contact>> {
        self.contact_where("public_key_hex = ?", params![public_key_hex])
    }

    /// Fetch the contact currently bound to a transport address.
    pub fn contact_by_address(&self, addr: &PeerAddress) -> Result<Option<Contact>> {
        self.contact_where("current_peer_address = ?", params![addr.as_str()])
    }

    /// Fetch the contact whose public-key hex starts with the prefix,
    /// failing closed when the prefix is ambiguous.
    pub fn contact_by_public_key_prefix(&self, prefix: &str) -> Result<Option<Contact>> {
        let pattern = format!("{prefix}%");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{CONTACT_SELECT} WHERE public_key_hex LIKE ? LIMIT 2"
            ))
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map(params![pattern], row_to_contact)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut found = Vec::new();
        for row in rows {
            found.push(row.map_err(|e| Error::Persistence(e.to_string()))?);
        }
        match found.len() {
            1 => Ok(found.pop()),
            _ => Ok(None),
        }
    }

    fn contact_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Contact>> {
        self.conn
            .query_row(
                &format!("{CONTACT_SELECT} WHERE {clause}"),
                args,
                row_to_contact,
            )
            .optional()
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    /// All contacts, unordered.
    pub fn all_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(CONTACT_SELECT)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_contact)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(|e| Error::Persistence(e.to_string()))?);
        }
        Ok(contacts)
    }

    /// Contacts for UI listings: favorites first, then most recent
    /// conversation, then name; blocked contacts excluded.
    pub fn visible_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                {CONTACT_SELECT}
                WHERE blocked = 0
                ORDER BY favorite DESC,
                         last_message_at IS NULL,
                         last_message_at DESC,
                         display_name COLLATE NOCASE ASC
                "#
            ))
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_contact)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(|e| Error::Persistence(e.to_string()))?);
        }
        Ok(contacts)
    }

    /// Remove a contact by hash id.
    pub fn delete_contact(&self, hash_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM contacts WHERE hash_id = ?", params![hash_id])
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(rows > 0)
    }

    /// Remove every contact, returning the count.
    pub fn delete_all_contacts(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM contacts", [])
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    /// Clear the bound address of whichever contact holds it.
    pub fn clear_contact_address(&self, addr: &PeerAddress) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE contacts SET connected = 0, current_peer_address = NULL,
                       updated_at = ?
                WHERE current_peer_address = ?
                "#,
                params![now_millis(), addr.as_str()],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Store a setting.
    pub fn set_setting(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                params![key, value],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Get a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    // ========================================================================
    // Block / favorite marks (by fingerprint)
    // ========================================================================

    /// Set or clear the blocked mark for a fingerprint.
    pub fn set_block_mark(&self, fp: &Fingerprint, blocked: bool) -> Result<()> {
        self.upsert_mark(fp, "blocked", blocked)
    }

    /// Set or clear the favorite mark for a fingerprint.
    pub fn set_favorite_mark(&self, fp: &Fingerprint, favorite: bool) -> Result<()> {
        self.upsert_mark(fp, "favorite", favorite)
    }

    fn upsert_mark(&self, fp: &Fingerprint, column: &str, value: bool) -> Result<()> {
        // `column` is a compile-time constant from the two callers above.
        self.conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO block_marks (fingerprint, {column}, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(fingerprint)
                    DO UPDATE SET {column} = ?2, updated_at = ?3
                    "#
                ),
                params![fp.as_str(), value as i32, now_millis()],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Whether a fingerprint is marked blocked.
    pub fn is_fingerprint_blocked(&self, fp: &Fingerprint) -> Result<bool> {
        self.mark_flag(fp, "blocked")
    }

    /// Whether a fingerprint is marked favorite.
    pub fn is_fingerprint_favorite(&self, fp: &Fingerprint) -> Result<bool> {
        self.mark_flag(fp, "favorite")
    }

    fn mark_flag(&self, fp: &Fingerprint, column: &str) -> Result<bool> {
        let flag: Option<i32> = self
            .conn
            .query_row(
                &format!("SELECT {column} FROM block_marks WHERE fingerprint = ?"),
                params![fp.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(flag == Some(1))
    }

    /// All fingerprints carrying the blocked mark.
    pub fn blocked_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        self.marked_fingerprints("blocked")
    }

    /// All fingerprints carrying the favorite mark.
    pub fn favorite_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        self.marked_fingerprints("favorite")
    }

    fn marked_fingerprints(&self, column: &str) -> Result<Vec<Fingerprint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT fingerprint FROM block_marks WHERE {column} = 1"
            ))
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let hex = row.map_err(|e| Error::Persistence(e.to_string()))?;
            out.push(Fingerprint::from_hex(&hex)?);
        }
        Ok(out)
    }
}

const CONTACT_SELECT: &str = r#"
    SELECT hash_id, public_key_hex, signing_key_hex, display_name, custom_name,
           trusted, blocked, favorite, groups_json, notes, verification_method,
           added_at, last_seen_at, last_message_at, unread_count,
           current_peer_address, connected, updated_at
    FROM contacts
"#;

fn insert_message_stmt(conn: &Connection, peer: &PeerAddress, msg: &Message) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO messages
        (id, peer_address, sender, content, timestamp_millis, is_private,
         delivery_status, recipient_nickname, sender_peer_address,
         encrypted_blob, is_encrypted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            msg.id.as_str(),
            peer.as_str(),
            msg.sender,
            msg.content,
            msg.timestamp,
            msg.is_private as i32,
            msg.delivery_status.encode(),
            msg.recipient_nickname,
            msg.sender_peer_address.as_ref().map(|a| a.as_str()),
            msg.encrypted_blob,
            msg.encrypted_blob.is_some() as i32,
        ],
    )
    .map_err(|e| Error::Persistence(format!("failed to store message: {}", e)))?;
    Ok(())
}

type MessageParts = (
    String,
    String,
    String,
    i64,
    i32,
    String,
    Option<String>,
    Option<String>,
    Option<Vec<u8>>,
);

fn row_to_message_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<MessageParts>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        let (id, sender, content, timestamp, is_private, status, nickname, origin, blob) =
            row.map_err(|e| Error::Persistence(e.to_string()))?;

        messages.push(Message {
            id: MessageId::new(id),
            sender,
            content,
            timestamp,
            is_private: is_private != 0,
            recipient_nickname: nickname,
            sender_peer_address: origin.map(PeerAddress::new),
            delivery_status: DeliveryStatus::decode(&status)?,
            encrypted_blob: blob,
        });
    }
    Ok(messages)
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let groups_json: Option<String> = row.get(8)?;
    let groups = match groups_json {
        Some(json) => serde_json::from_str(&json).unwrap_or_default(),
        None => Vec::new(),
    };
    let method: Option<String> = row.get(10)?;
    let addr: Option<String> = row.get(15)?;

    Ok(Contact {
        hash_id: row.get(0)?,
        public_key_hex: row.get(1)?,
        signing_key_hex: row.get(2)?,
        display_name: row.get(3)?,
        custom_name: row.get(4)?,
        trusted: row.get::<_, i32>(5)? != 0,
        blocked: row.get::<_, i32>(6)? != 0,
        favorite: row.get::<_, i32>(7)? != 0,
        groups,
        notes: row.get(9)?,
        verification_method: method.as_deref().and_then(VerificationMethod::from_str),
        added_at: row.get(11)?,
        last_seen_at: row.get(12)?,
        last_message_at: row.get(13)?,
        unread_count: row.get::<_, i64>(14)? as u32,
        current_peer_address: addr.map(PeerAddress::new),
        connected: row.get::<_, i32>(16)? != 0,
        updated_at: row.get(17)?,
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
