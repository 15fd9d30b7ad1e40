//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- Per-conversation message log.
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    peer_address TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp_millis INTEGER NOT NULL,
    is_private INTEGER NOT NULL DEFAULT 1,
    delivery_status TEXT NOT NULL DEFAULT 'sending',
    recipient_nickname TEXT,
    sender_peer_address TEXT,
    encrypted_blob BLOB,
    is_encrypted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_peer_time
    ON messages(peer_address, timestamp_millis);

-- Known identities. hash_id is a pure function of public_key_hex;
-- public_key_hex is NULL for placeholders added by hash id only.
CREATE TABLE IF NOT EXISTS contacts (
    hash_id TEXT PRIMARY KEY,
    public_key_hex TEXT UNIQUE,
    signing_key_hex TEXT,
    display_name TEXT NOT NULL,
    custom_name TEXT,
    trusted INTEGER NOT NULL DEFAULT 0,
    blocked INTEGER NOT NULL DEFAULT 0,
    favorite INTEGER NOT NULL DEFAULT 0,
    groups_json TEXT,
    notes TEXT,
    verification_method TEXT,
    added_at INTEGER NOT NULL,
    last_seen_at INTEGER,
    last_message_at INTEGER,
    unread_count INTEGER NOT NULL DEFAULT 0,
    current_peer_address TEXT,
    connected INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contacts_trusted ON contacts(trusted);
CREATE INDEX IF NOT EXISTS idx_contacts_blocked ON contacts(blocked);

-- Block/favorite marks keyed by fingerprint. Kept apart from contacts:
-- they apply to identities that were never added as contacts and must
-- survive ephemeral-address rotation.
CREATE TABLE IF NOT EXISTS block_marks (
    fingerprint TEXT PRIMARY KEY,
    blocked INTEGER NOT NULL DEFAULT 0,
    favorite INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

-- Settings table.
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version.
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;
