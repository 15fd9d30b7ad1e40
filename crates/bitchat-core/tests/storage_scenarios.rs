//! End-to-end scenarios for the encrypted stores and the panic wipe.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use bitchat_core::chat::{DeliveryStatus, Message, MessageId};
use bitchat_core::config::Preferences;
use bitchat_core::contacts::{ContactStore, VerificationMethod};
use bitchat_core::identity::PeerAddress;
use bitchat_core::storage::{
    Database, DatabaseConfig, EncryptedDbKeystore, MessageStore, DEFAULT_DB_NAME,
};
use bitchat_core::wipe::PanicWipe;

fn msg(id: &str, ts: i64) -> Message {
    Message {
        id: MessageId::new(id),
        sender: "Alice".into(),
        content: format!("message {id}"),
        timestamp: ts,
        is_private: true,
        recipient_nickname: None,
        sender_peer_address: None,
        delivery_status: DeliveryStatus::Sent,
        encrypted_blob: None,
    }
}

fn store_with(prefs: Preferences) -> MessageStore {
    let config = DatabaseConfig {
        path: String::new(),
        in_memory: true,
    };
    let db = Database::open(&config, &[0u8; 32]).expect("open");
    MessageStore::new(Arc::new(Mutex::new(db)), Arc::new(RwLock::new(prefs)))
}

/// With a cap of 3, saving 5 messages ts=1..5 leaves only ts=3,4,5 on
/// disk.
#[tokio::test]
async fn cap_keeps_three_newest() {
    let prefs = Preferences {
        persistence_enabled: true,
        message_cap: 3,
        ..Preferences::default()
    };
    let store = store_with(prefs);
    let peer = PeerAddress::new("X");

    for ts in 1..=5 {
        store
            .save(&peer, &msg(&format!("m{ts}"), ts))
            .await
            .expect("save");
    }

    let stored = store.load(&peer).await.expect("load");
    assert_eq!(
        stored.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
        vec![3, 4, 5]
    );
    assert_eq!(store.count(&peer).await.expect("count"), 3);
}

/// After retention, no stored message is older than the cutoff.
#[tokio::test]
async fn retention_removes_old_messages() {
    let prefs = Preferences {
        persistence_enabled: true,
        ..Preferences::default()
    };
    let store = store_with(prefs);
    let peer = PeerAddress::new("X");

    let now = chrono::Utc::now().timestamp_millis();
    let old = now - chrono::Duration::days(40).num_milliseconds();
    let recent = now - chrono::Duration::days(5).num_milliseconds();

    store.save(&peer, &msg("old", old)).await.expect("save");
    store.save(&peer, &msg("new", recent)).await.expect("save");

    let removed = store
        .apply_retention(chrono::Duration::days(30))
        .await
        .expect("retention");
    assert_eq!(removed, 1);

    let cutoff = chrono::Utc::now().timestamp_millis()
        - chrono::Duration::days(30).num_milliseconds();
    let stored = store.load(&peer).await.expect("load");
    assert!(stored.iter().all(|m| m.timestamp >= cutoff));
}

/// The database is unreadable without the right key.
#[test]
fn database_requires_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(DEFAULT_DB_NAME);
    let config = DatabaseConfig {
        path: path.display().to_string(),
        in_memory: false,
    };

    let db = Database::open(&config, &[0x11u8; 32]).expect("open");
    let peer = PeerAddress::new("X");
    db.save_message(&peer, &msg("secret", 1), 1000).expect("save");
    db.close();

    assert!(Database::open(&config, &[0x22u8; 32]).is_err());

    let db = Database::open(&config, &[0x11u8; 32]).expect("reopen");
    assert_eq!(db.message_count(&peer).expect("count"), 1);
}

/// Panic wipe with contacts and messages on disk: afterwards
/// everything is gone and the database key is fresh.
#[tokio::test]
async fn panic_wipe_scenario() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_path_buf();
    let cache_dir = data_dir.join("cache");
    std::fs::create_dir_all(&cache_dir).expect("mkdir");

    let keystore = Arc::new(EncryptedDbKeystore::new(&data_dir));
    let key_before = keystore.get_or_create().await.expect("key");

    let db_path = data_dir.join(DEFAULT_DB_NAME);
    let config = DatabaseConfig {
        path: db_path.display().to_string(),
        in_memory: false,
    };
    let db = Arc::new(Mutex::new(
        Database::open(&config, key_before.as_ref()).expect("open"),
    ));

    let prefs = Preferences {
        persistence_enabled: true,
        ..Preferences::default()
    };
    prefs.save(&data_dir).expect("save prefs");

    // 3 contacts, 100 messages.
    let contacts = ContactStore::new(db.clone()).await.expect("contacts");
    for i in 0..3u8 {
        contacts
            .add_from_peer(
                &[i + 1; 32],
                None,
                &format!("contact-{i}"),
                None,
                false,
                VerificationMethod::Qr,
            )
            .await
            .expect("add contact");
    }
    let store = MessageStore::new(db.clone(), Arc::new(RwLock::new(prefs)));
    let peer = PeerAddress::new("X");
    for i in 0..100i64 {
        store
            .save(&peer, &msg(&format!("m{i:03}"), i))
            .await
            .expect("save");
    }
    assert_eq!(store.count(&peer).await.expect("count"), 100);

    // Release store handles so the wipe holds the last one.
    drop(contacts);
    drop(store);

    let wipe = PanicWipe::new(&data_dir, &cache_dir, keystore.clone(), Some(db));
    let report = wipe.run().await;

    assert!(report.success, "errors: {:?}", report.errors);
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    assert!(!db_path.exists());

    // A fresh database under the fresh key holds nothing.
    let key_after = keystore.get_or_create().await.expect("new key");
    assert_ne!(key_before.as_ref(), key_after.as_ref());

    let db = Arc::new(Mutex::new(
        Database::open(&config, key_after.as_ref()).expect("reopen"),
    ));
    let contacts = ContactStore::new(db.clone()).await.expect("contacts");
    assert!(contacts.get_all().await.expect("get all").is_empty());

    let prefs = Preferences::load(&data_dir).expect("prefs");
    assert_eq!(prefs, Preferences::default());
}

/// Batch saves land in one transaction and still honor the cap.
#[tokio::test]
async fn batch_save_honors_cap() {
    let prefs = Preferences {
        persistence_enabled: true,
        message_cap: 10,
        ..Preferences::default()
    };
    let store = store_with(prefs);
    let peer = PeerAddress::new("X");

    let batch: Vec<Message> = (0..25).map(|i| msg(&format!("m{i:02}"), i)).collect();
    store.save_batch(&peer, &batch).await.expect("batch");

    assert_eq!(store.count(&peer).await.expect("count"), 10);
    let stored = store.load(&peer).await.expect("load");
    assert_eq!(stored.first().map(|m| m.timestamp), Some(15));
    assert_eq!(stored.last().map(|m| m.timestamp), Some(24));
}
