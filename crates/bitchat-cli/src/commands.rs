//! CLI command implementations.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{Mutex, RwLock};

use bitchat_core::chat::{ConversationEngine, Message, MessageId, SendPipeline, SendRequest};
use bitchat_core::config::Preferences;
use bitchat_core::contacts::{Blocklist, ContactStore, VerificationMethod};
use bitchat_core::identity::{codec, BitchatIdentity, PeerAddress};
use bitchat_core::storage::{
    Database, DatabaseConfig, EncryptedDbKeystore, MessageStore, DEFAULT_DB_NAME,
};
use bitchat_core::transport::MeshTransport;
use bitchat_core::wipe::PanicWipe;

/// Settings keys for the stored identity.
const SETTING_NOISE_SECRET: &str = "identity.noise_secret";
const SETTING_SIGNING_SECRET: &str = "identity.signing_secret";

/// Expand a leading `~` to the home directory.
pub fn expand_data_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Everything a command needs, wired the way the app wires it.
struct App {
    data_dir: PathBuf,
    prefs: Arc<RwLock<Preferences>>,
    keystore: Arc<EncryptedDbKeystore>,
    db: Arc<Mutex<Database>>,
    contacts: Arc<ContactStore>,
    blocklist: Blocklist,
    messages: MessageStore,
}

impl App {
    async fn open(data_dir: &Path) -> Result<Self> {
        let prefs = Preferences::load(data_dir).context("failed to load preferences")?;
        let prefs = Arc::new(RwLock::new(prefs));

        let keystore = Arc::new(EncryptedDbKeystore::new(data_dir));
        let key = keystore
            .get_or_create()
            .await
            .context("failed to obtain database key")?;

        let config = DatabaseConfig {
            path: data_dir.join(DEFAULT_DB_NAME).display().to_string(),
            in_memory: false,
        };
        let db = Arc::new(Mutex::new(
            Database::open(&config, key.as_ref()).context("failed to open database")?,
        ));

        let contacts = Arc::new(
            ContactStore::new(db.clone())
                .await
                .context("failed to open contact store")?,
        );
        let blocklist = Blocklist::new(db.clone());
        let messages = MessageStore::new(db.clone(), prefs.clone());

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            prefs,
            keystore,
            db,
            contacts,
            blocklist,
            messages,
        })
    }

    async fn load_identity(&self) -> Result<Option<BitchatIdentity>> {
        let db = self.db.lock().await;
        let noise = db.get_setting(SETTING_NOISE_SECRET)?;
        let signing = db.get_setting(SETTING_SIGNING_SECRET)?;
        drop(db);

        let (Some(noise), Some(signing)) = (noise, signing) else {
            return Ok(None);
        };
        let noise: [u8; 32] = noise
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored noise secret corrupted"))?;
        let signing: [u8; 32] = signing
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored signing secret corrupted"))?;
        Ok(Some(BitchatIdentity::from_secret_bytes(noise, signing)))
    }

    async fn load_or_create_identity(&self) -> Result<BitchatIdentity> {
        if let Some(identity) = self.load_identity().await? {
            return Ok(identity);
        }
        let identity = BitchatIdentity::generate();
        self.store_identity(&identity).await?;
        println!("Generated new identity: {}", identity.hash_id());
        Ok(identity)
    }

    async fn store_identity(&self, identity: &BitchatIdentity) -> Result<()> {
        let (noise, signing) = identity.secret_bytes();
        let db = self.db.lock().await;
        db.set_setting(SETTING_NOISE_SECRET, &noise)?;
        db.set_setting(SETTING_SIGNING_SECRET, &signing)?;
        Ok(())
    }

    /// Our own transport address: the 16-hex-char BLE fingerprint
    /// prefix of the identity fingerprint.
    fn my_peer_address(identity: &BitchatIdentity) -> PeerAddress {
        let fp = identity.fingerprint();
        PeerAddress::new(&fp.as_str()[..16])
    }
}

/// Transport used by the CLI: packets are queued for the mesh daemon;
/// delivery confirmations arrive out of band.
struct QueueingTransport;

impl MeshTransport for QueueingTransport {
    fn has_session(&self, _peer: &PeerAddress) -> bool {
        false
    }
    fn initiate_handshake(&self, peer: &PeerAddress) -> bitchat_core::Result<()> {
        tracing::info!(peer = %peer, "Handshake queued");
        Ok(())
    }
    fn send_private(
        &self,
        _content: &str,
        to: &PeerAddress,
        _nick: &str,
        id: &MessageId,
    ) -> bitchat_core::Result<()> {
        tracing::info!(peer = %to, id = %id, "Message queued for mesh delivery");
        Ok(())
    }
    fn send_read_receipt(&self, to: &PeerAddress, id: &MessageId) -> bitchat_core::Result<()> {
        tracing::info!(peer = %to, id = %id, "Read receipt queued");
        Ok(())
    }
    fn send_announce(&self, to: &PeerAddress) -> bitchat_core::Result<()> {
        tracing::info!(peer = %to, "Announce queued");
        Ok(())
    }
}

pub async fn init(data_dir: &Path, force: bool) -> Result<()> {
    let app = App::open(data_dir).await?;

    if !force && app.load_identity().await?.is_some() {
        bail!("identity already exists (use --force to overwrite)");
    }

    let identity = BitchatIdentity::generate();
    app.store_identity(&identity).await?;

    println!("New identity created");
    println!("  Hash ID:     {}", identity.hash_id());
    println!("  Fingerprint: {}", identity.fingerprint().display_groups());
    Ok(())
}

pub async fn identity(data_dir: &Path) -> Result<()> {
    let app = App::open(data_dir).await?;
    let identity = app.load_or_create_identity().await?;

    println!("Hash ID:     {}", identity.hash_id());
    println!("Fingerprint: {}", identity.fingerprint().display_groups());
    println!("QR URI:      {}", codec::qr_uri(&identity.public_key()));
    Ok(())
}

pub async fn qr(data_dir: &Path) -> Result<()> {
    let app = App::open(data_dir).await?;
    let identity = app.load_or_create_identity().await?;
    println!("{}", codec::qr_uri(&identity.public_key()));
    Ok(())
}

pub async fn add(data_dir: &Path, target: &str, name: Option<String>) -> Result<()> {
    let app = App::open(data_dir).await?;

    let (hash_id, method) = if target.starts_with(codec::QR_PREFIX) {
        let hash = codec::parse_qr_uri(target).context("invalid QR URI")?;
        (hash, VerificationMethod::Qr)
    } else {
        if !codec::is_valid_hash_id(target) {
            bail!("not a valid hash id or QR URI: {target}");
        }
        (target.to_string(), VerificationMethod::Manual)
    };

    let contact = app
        .contacts
        .add_by_hash_id(&hash_id, name, method)
        .await
        .context("failed to add contact")?;

    println!("Added {} ({})", contact.effective_name(), contact.hash_id);
    Ok(())
}

pub async fn contacts(data_dir: &Path) -> Result<()> {
    let app = App::open(data_dir).await?;
    let listing = app.contacts.list_visible().await?;

    if listing.is_empty() {
        println!("No contacts");
        return Ok(());
    }

    for contact in listing {
        let star = if contact.favorite { "*" } else { " " };
        let live = if contact.connected { "online" } else { "offline" };
        println!(
            "{star} {:<20} {}  {:>3} unread  {}",
            contact.effective_name(),
            contact.hash_id,
            contact.unread_count,
            live
        );
    }
    Ok(())
}

pub async fn set_blocked(data_dir: &Path, hash_id: &str, blocked: bool) -> Result<()> {
    let app = App::open(data_dir).await?;
    let contact = app
        .contacts
        .set_blocked(hash_id, blocked)
        .await
        .context("failed to update contact")?;
    let verb = if blocked { "Blocked" } else { "Unblocked" };
    println!("{verb} {}", contact.effective_name());
    Ok(())
}

pub async fn set_favorite(data_dir: &Path, hash_id: &str, favorite: bool) -> Result<()> {
    let app = App::open(data_dir).await?;
    let contact = app
        .contacts
        .set_favorite(hash_id, favorite)
        .await
        .context("failed to update contact")?;
    let verb = if favorite { "Favorited" } else { "Unfavorited" };
    println!("{verb} {}", contact.effective_name());
    Ok(())
}

pub async fn send(data_dir: &Path, address: &str, message: &str) -> Result<()> {
    let app = App::open(data_dir).await?;
    let identity = app.load_or_create_identity().await?;

    let transport: Arc<dyn MeshTransport> = Arc::new(QueueingTransport);
    let engine = Arc::new(ConversationEngine::new(
        App::my_peer_address(&identity),
        transport.clone(),
        app.contacts.clone(),
        app.blocklist.clone(),
        app.messages.clone(),
    ));
    let pipeline = SendPipeline::new(engine.clone(), transport);

    let peer = PeerAddress::new(address);
    pipeline
        .submit(SendRequest {
            content: message.to_string(),
            peer_addr: peer.clone(),
            recipient_nickname: None,
            sender_nickname: None,
        })
        .await
        .context("failed to queue message")?;

    // Let the single-writer worker flush before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let conv = engine.conversation(&peer).await;
    if let Some(last) = conv.last() {
        println!("Queued [{}] to {}", last.id, address);
    }
    if !app.prefs.read().await.persistence_enabled {
        println!("(persistence is off; enable with `bitchat prefs --persistence true`)");
    }
    Ok(())
}

pub async fn history(data_dir: &Path, address: &str, limit: usize) -> Result<()> {
    let app = App::open(data_dir).await?;
    let peer = PeerAddress::new(address);

    let mut page = app.messages.load_paginated(&peer, limit, 0).await?;
    if page.is_empty() {
        println!("No stored messages for {address}");
        return Ok(());
    }
    page.reverse();

    for msg in &page {
        print_message(msg);
    }
    Ok(())
}

pub async fn search(data_dir: &Path, query: &str, address: Option<&str>) -> Result<()> {
    let app = App::open(data_dir).await?;
    let peer = address.map(PeerAddress::new);

    let hits = app.messages.search(query, peer.as_ref()).await?;
    if hits.is_empty() {
        println!("No matches");
        return Ok(());
    }
    for msg in &hits {
        print_message(msg);
    }
    Ok(())
}

pub async fn prefs(
    data_dir: &Path,
    persistence: Option<bool>,
    retention_days: Option<u32>,
) -> Result<()> {
    let mut prefs = Preferences::load(data_dir)?;

    let mut changed = false;
    if let Some(enabled) = persistence {
        prefs.persistence_enabled = enabled;
        changed = true;
    }
    if let Some(days) = retention_days {
        prefs.message_retention_days = days;
        changed = true;
    }
    if changed {
        prefs.save(data_dir)?;

        // Apply the retention cutoff right away.
        let app = App::open(data_dir).await?;
        let removed = app.messages.apply_retention(prefs.retention()).await?;
        if removed > 0 {
            println!("Removed {removed} expired messages");
        }
    }

    println!("persistence_enabled    = {}", prefs.persistence_enabled);
    println!("show_contacts_only     = {}", prefs.show_contacts_only);
    println!("accept_friend_requests = {}", prefs.accept_friend_requests);
    println!("message_retention_days = {}", prefs.message_retention_days);
    println!("message_cap            = {}", prefs.message_cap);
    Ok(())
}

pub async fn wipe(data_dir: &Path, yes: bool) -> Result<()> {
    if !yes {
        print!("This destroys ALL local data. Type 'wipe' to confirm: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        if line.trim() != "wipe" {
            println!("Aborted");
            return Ok(());
        }
    }

    let app = App::open(data_dir).await?;
    let App {
        data_dir,
        keystore,
        db,
        contacts,
        blocklist,
        messages,
        ..
    } = app;
    // Release the store clones so the wipe holds the last handle.
    drop(contacts);
    drop(blocklist);
    drop(messages);

    let wipe = PanicWipe::new(&data_dir, data_dir.join("cache"), keystore, Some(db));
    let report = wipe.run().await;

    println!(
        "Wipe {} in {} ms ({} items removed)",
        if report.success { "succeeded" } else { "finished with errors" },
        report.duration_ms,
        report.deleted_items.len()
    );
    for warning in &report.warnings {
        eprintln!("  warning: {warning}");
    }
    for err in &report.errors {
        eprintln!("  error: {err}");
    }
    Ok(())
}

fn print_message(msg: &Message) {
    let when = chrono_fmt(msg.timestamp);
    println!(
        "[{when}] {:<12} {}  ({})",
        msg.sender,
        msg.content,
        msg.delivery_status.encode()
    );
}

fn chrono_fmt(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}
