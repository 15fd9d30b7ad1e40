//! The in-memory conversation engine.
//!
//! Central chat state keyed by peer address: per-conversation message
//! sequences, the unread set, the pending read-receipt queue, and the
//! current selection. The engine deduplicates and orders messages,
//! consolidates conversations that belong to one identity spread across
//! several ephemeral addresses, and drives read receipts and delivery
//! status.
//!
//! Observers receive copy-on-read snapshots: a conversation is a whole
//! re-snapshot on change, never an append log, because `sanitize`
//! re-sorts in place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, warn};

use crate::chat::message::{DeliveryStatus, Message, MessageId};
use crate::contacts::{Blocklist, Contact, ContactStore};
use crate::error::{Error, Result};
use crate::identity::PeerAddress;
use crate::logging::RedactedAddr;
use crate::storage::MessageStore;
use crate::transport::MeshTransport;

/// Events emitted by the engine for UI consumption.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An inbound message was accepted.
    MessageReceived {
        /// Conversation it landed in.
        from: PeerAddress,
        /// The message id.
        message_id: MessageId,
    },
    /// A conversation's contents changed (insert, sanitize, merge).
    ConversationChanged {
        /// The conversation's address.
        addr: PeerAddress,
    },
    /// A message's delivery status advanced.
    DeliveryUpdated {
        /// The message id.
        message_id: MessageId,
        /// The new status.
        status: DeliveryStatus,
    },
    /// A peer was blocked.
    PeerBlocked {
        /// The blocked peer's address.
        addr: PeerAddress,
    },
    /// A system notice for the shared chat log.
    System {
        /// Notice text.
        text: String,
    },
}

#[derive(Default)]
struct EngineState {
    conversations: HashMap<PeerAddress, Vec<Message>>,
    unread: HashSet<PeerAddress>,
    pending_receipts: HashMap<PeerAddress, Vec<MessageId>>,
    selected: Option<PeerAddress>,
    system_log: Vec<Message>,
}

/// The conversation engine.
pub struct ConversationEngine {
    my_peer_address: PeerAddress,
    state: RwLock<EngineState>,
    transport: Arc<dyn MeshTransport>,
    contacts: Arc<ContactStore>,
    blocklist: Blocklist,
    messages: MessageStore,
    events: broadcast::Sender<EngineEvent>,
    snapshot: watch::Sender<HashMap<PeerAddress, Vec<Message>>>,
}

impl ConversationEngine {
    /// Wire up an engine. The transport capability and the stores are
    /// injected; the transport calls back into [`handle_incoming`],
    /// [`on_delivery`], and [`on_read`].
    ///
    /// [`handle_incoming`]: Self::handle_incoming
    /// [`on_delivery`]: Self::on_delivery
    /// [`on_read`]: Self::on_read
    pub fn new(
        my_peer_address: PeerAddress,
        transport: Arc<dyn MeshTransport>,
        contacts: Arc<ContactStore>,
        blocklist: Blocklist,
        messages: MessageStore,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (snapshot, _) = watch::channel(HashMap::new());
        Self {
            my_peer_address,
            state: RwLock::new(EngineState::default()),
            transport,
            contacts,
            blocklist,
            messages,
            events,
            snapshot,
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to whole-map conversation snapshots.
    pub fn observe_conversations(
        &self,
    ) -> watch::Receiver<HashMap<PeerAddress, Vec<Message>>> {
        self.snapshot.subscribe()
    }

    /// Copy of one conversation.
    pub async fn conversation(&self, addr: &PeerAddress) -> Vec<Message> {
        self.state
            .read()
            .await
            .conversations
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    /// Addresses of all current conversations.
    pub async fn conversation_addresses(&self) -> Vec<PeerAddress> {
        self.state.read().await.conversations.keys().cloned().collect()
    }

    /// The currently focused conversation, if any.
    pub async fn selected(&self) -> Option<PeerAddress> {
        self.state.read().await.selected.clone()
    }

    /// Peers with at least one unread inbound message.
    pub async fn unread_peers(&self) -> HashSet<PeerAddress> {
        self.state.read().await.unread.clone()
    }

    /// Copy of the shared system log.
    pub async fn system_log(&self) -> Vec<Message> {
        self.state.read().await.system_log.clone()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, state: &EngineState) {
        // send_replace updates the value even with no receivers.
        self.snapshot.send_replace(state.conversations.clone());
    }

    /// Dedup by id (stable keep-first) and sort ascending by timestamp.
    fn sanitize_vec(msgs: &mut Vec<Message>) {
        let mut seen = HashSet::with_capacity(msgs.len());
        msgs.retain(|m| seen.insert(m.id.clone()));
        msgs.sort_by_key(|m| m.timestamp);
    }

    /// Sanitize one conversation: afterwards it contains no duplicate
    /// ids and is sorted ascending by timestamp. Idempotent.
    pub async fn sanitize(&self, addr: &PeerAddress) {
        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.get_mut(addr) {
            Self::sanitize_vec(conv);
            self.publish(&state);
        }
    }

    /// Insert a message into a conversation (mesh glue and the send
    /// pipeline call this), then sanitize. The write is persisted in
    /// the background; UI correctness never waits on disk.
    pub async fn insert_message(&self, addr: &PeerAddress, msg: Message) {
        {
            let mut state = self.state.write().await;
            let conv = state.conversations.entry(addr.clone()).or_default();
            conv.push(msg.clone());
            Self::sanitize_vec(conv);
            self.publish(&state);
        }
        self.persist(addr, msg);
        self.emit(EngineEvent::ConversationChanged { addr: addr.clone() });
    }

    fn persist(&self, addr: &PeerAddress, msg: Message) {
        let store = self.messages.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save(&addr, &msg).await {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Failed to persist message");
            }
        });
    }

    /// Merge every conversation belonging to `display_name` into
    /// `target`, returning the merged sequence. Idempotent.
    ///
    /// A contact reappearing under a new ephemeral address would
    /// otherwise leave the user with one conversation per address.
    pub async fn consolidate(
        &self,
        target: &PeerAddress,
        display_name: &str,
    ) -> Vec<Message> {
        let mut state = self.state.write().await;

        let mut sources: Vec<PeerAddress> = state
            .conversations
            .iter()
            .filter(|(addr, msgs)| {
                *addr != target
                    && msgs.iter().any(|m| {
                        m.sender == display_name
                            || m.recipient_nickname.as_deref() == Some(display_name)
                    })
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        sources.sort();

        let merged = Self::merge_into(&mut state, target, &sources);
        self.publish(&state);
        merged
    }

    /// Merge temporary relay conversations (`nostr_<pub16>` keys) whose
    /// identity resolves to `target` via the contact store.
    pub async fn merge_nostr_conversations(&self, target: &PeerAddress) -> Result<()> {
        let candidates: Vec<(PeerAddress, String)> = {
            let state = self.state.read().await;
            state
                .conversations
                .keys()
                .filter(|addr| *addr != target)
                .filter_map(|addr| {
                    addr.nostr_temp_key()
                        .map(|prefix| (addr.clone(), prefix.to_string()))
                })
                .collect()
        };

        let mut confirmed = Vec::new();
        for (addr, prefix) in candidates {
            // Fails closed: unknown or ambiguous prefixes do not merge.
            if let Some(contact) = self.contacts.get_by_public_key_prefix(&prefix).await? {
                if contact.current_peer_address.as_ref() == Some(target) {
                    confirmed.push(addr);
                }
            }
        }
        if confirmed.is_empty() {
            return Ok(());
        }
        confirmed.sort();

        let mut state = self.state.write().await;
        Self::merge_into(&mut state, target, &confirmed);
        self.publish(&state);
        Ok(())
    }

    /// Shared merge: union sources into target, sanitize, transfer
    /// unread, clear target's pending receipts.
    fn merge_into(
        state: &mut EngineState,
        target: &PeerAddress,
        sources: &[PeerAddress],
    ) -> Vec<Message> {
        let mut union = state.conversations.remove(target).unwrap_or_default();
        let mut transferred_unread = false;

        for src in sources {
            if let Some(mut msgs) = state.conversations.remove(src) {
                union.append(&mut msgs);
            }
            if state.unread.remove(src) {
                transferred_unread = true;
            }
            // Receipt queues for removed conversations are orphaned.
            state.pending_receipts.remove(src);
        }

        Self::sanitize_vec(&mut union);
        state.conversations.insert(target.clone(), union.clone());

        if transferred_unread {
            state.unread.insert(target.clone());
        }
        state.pending_receipts.remove(target);
        union
    }

    /// Focus a private chat: establish the session, consolidate, merge
    /// persisted history, and drain read receipts. Returns the
    /// conversation snapshot.
    pub async fn start_private_chat(&self, addr: &PeerAddress) -> Result<Vec<Message>> {
        if self.is_address_blocked(addr).await? {
            let note = Message::system("cannot open chat: peer is blocked");
            {
                let mut state = self.state.write().await;
                state.system_log.push(note.clone());
            }
            self.emit(EngineEvent::System { text: note.content });
            return Err(Error::BlockedPeer);
        }

        self.ensure_session(addr);

        let contact = self.contacts.get_by_address(addr).await?;
        if let Some(contact) = &contact {
            self.consolidate(addr, &contact.display_name).await;
        }
        self.merge_nostr_conversations(addr).await?;
        self.sanitize(addr).await;

        {
            let mut state = self.state.write().await;
            state.selected = Some(addr.clone());
            state.unread.remove(addr);
            self.publish(&state);
        }

        // Clear the durable unread counter off the UI path.
        if let Some(contact) = &contact {
            let contacts = self.contacts.clone();
            let hash_id = contact.hash_id.clone();
            tokio::spawn(async move {
                if let Err(e) = contacts.clear_unread(&hash_id).await {
                    debug!(error = %e, "Failed to clear unread counter");
                }
            });
        }

        // Merge persisted history; still dedup by id.
        match self.messages.load(addr).await {
            Ok(persisted) if !persisted.is_empty() => {
                let mut state = self.state.write().await;
                let conv = state.conversations.entry(addr.clone()).or_default();
                conv.extend(persisted);
                Self::sanitize_vec(conv);
                self.publish(&state);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Failed to load persisted history");
            }
        }

        self.drain_read_receipts(addr).await;

        Ok(self.conversation(addr).await)
    }

    /// Handshake-initiator tie-break: lexicographically smaller address
    /// initiates; the larger side announces AND initiates, so both
    /// sides accelerate without a symmetric collision.
    fn ensure_session(&self, addr: &PeerAddress) {
        if self.transport.has_session(addr) {
            return;
        }
        if self.my_peer_address < *addr {
            if let Err(e) = self.transport.initiate_handshake(addr) {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Handshake initiation failed");
            }
        } else {
            if let Err(e) = self.transport.send_announce(addr) {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Announce failed");
            }
            if let Err(e) = self.transport.initiate_handshake(addr) {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Handshake initiation failed");
            }
        }
    }

    /// Emit one read receipt per inbound message from `addr`, then
    /// clear the unread entry. Each receipt is best effort; one failure
    /// never stops the rest.
    async fn drain_read_receipts(&self, addr: &PeerAddress) {
        let ids: Vec<MessageId> = {
            let mut state = self.state.write().await;
            state.pending_receipts.remove(addr);
            state.unread.remove(addr);
            state
                .conversations
                .get(addr)
                .map(|msgs| {
                    msgs.iter()
                        .filter(|m| m.sender_peer_address.as_ref() == Some(addr))
                        .map(|m| m.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for id in ids {
            if let Err(e) = self.transport.send_read_receipt(addr, &id) {
                warn!(error = %e, addr = %RedactedAddr(addr.as_str()), "Read receipt failed");
            }
        }
    }

    /// Accept an inbound message.
    ///
    /// Mesh-origin messages (those carrying a `sender_peer_address`)
    /// only get bookkeeping here: the outer state store inserts them
    /// via [`insert_message`](Self::insert_message), so the engine must
    /// not double-insert. Relay-origin messages attach to the selected
    /// conversation.
    pub async fn handle_incoming(&self, msg: Message, suppress_unread: bool) -> Result<()> {
        match msg.sender_peer_address.clone() {
            Some(origin) => {
                if self.is_address_blocked(&origin).await? {
                    debug!(addr = %RedactedAddr(origin.as_str()), "Dropping message from blocked peer");
                    return Ok(());
                }

                let count_unread = {
                    let mut state = self.state.write().await;
                    let conv = state.conversations.entry(origin.clone()).or_default();
                    Self::sanitize_vec(conv);

                    let focused = state.selected.as_ref() == Some(&origin);
                    let count_unread = !focused && !suppress_unread;
                    if count_unread {
                        state
                            .pending_receipts
                            .entry(origin.clone())
                            .or_default()
                            .push(msg.id.clone());
                        state.unread.insert(origin.clone());
                    }
                    self.publish(&state);
                    count_unread
                };

                if count_unread {
                    let contacts = self.contacts.clone();
                    let origin = origin.clone();
                    tokio::spawn(async move {
                        if let Ok(Some(contact)) = contacts.get_by_address(&origin).await {
                            if let Err(e) = contacts.increment_unread(&contact.hash_id).await {
                                debug!(error = %e, "Failed to bump unread counter");
                            }
                        }
                    });
                }

                self.emit(EngineEvent::MessageReceived {
                    from: origin,
                    message_id: msg.id,
                });
                Ok(())
            }
            None => {
                // Relay origin: attach to the selected conversation.
                let selected = {
                    let mut state = self.state.write().await;
                    let Some(selected) = state.selected.clone() else {
                        debug!("Relay message with no selected conversation; dropping");
                        return Ok(());
                    };
                    let conv = state.conversations.entry(selected.clone()).or_default();
                    conv.push(msg.clone());
                    Self::sanitize_vec(conv);
                    self.publish(&state);
                    selected
                };

                self.persist(&selected, msg.clone());
                self.emit(EngineEvent::MessageReceived {
                    from: selected,
                    message_id: msg.id,
                });
                Ok(())
            }
        }
    }

    /// Apply a delivery-status update by message id under the monotone
    /// rule. Backward transitions are ignored.
    pub async fn update_delivery(&self, id: &MessageId, status: DeliveryStatus) {
        let updated_addr = {
            let mut state = self.state.write().await;
            let mut updated = None;
            'scan: for (addr, msgs) in state.conversations.iter_mut() {
                for m in msgs.iter_mut() {
                    if m.id == *id {
                        if m.apply_status(status.clone()) {
                            updated = Some(addr.clone());
                        }
                        break 'scan;
                    }
                }
            }
            if updated.is_some() {
                self.publish(&state);
            }
            updated
        };

        if let Some(addr) = updated_addr {
            let store = self.messages.clone();
            let store_id = id.clone();
            let store_status = status.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_status(&store_id, &addr, &store_status).await {
                    debug!(error = %e, "Failed to persist status update");
                }
            });
            self.emit(EngineEvent::DeliveryUpdated {
                message_id: id.clone(),
                status,
            });
        }
    }

    /// Transport callback: delivery confirmation.
    pub async fn on_delivery(&self, id: &MessageId, by: &str, at: i64) {
        self.update_delivery(
            id,
            DeliveryStatus::Delivered {
                to: by.to_string(),
                at,
            },
        )
        .await;
    }

    /// Transport callback: read receipt.
    pub async fn on_read(&self, id: &MessageId, by: &str, at: i64) {
        self.update_delivery(
            id,
            DeliveryStatus::Read {
                by: by.to_string(),
                at,
            },
        )
        .await;
    }

    /// Whether the identity behind an address is blocked. Resolution
    /// goes through the contact store so the check survives
    /// ephemeral-address rotation; unknown addresses are not blocked.
    pub async fn is_address_blocked(&self, addr: &PeerAddress) -> Result<bool> {
        let contact = match self.contacts.get_by_address(addr).await? {
            Some(contact) => Some(contact),
            None => match addr.nostr_temp_key() {
                Some(prefix) => self.contacts.get_by_public_key_prefix(prefix).await?,
                None => None,
            },
        };

        let Some(contact) = contact else {
            return Ok(false);
        };
        if contact.blocked {
            return Ok(true);
        }
        match contact.fingerprint() {
            Some(fp) => self.blocklist.is_blocked(&fp).await,
            None => Ok(false),
        }
    }

    /// Block the identity currently reachable at `addr`. The block is
    /// recorded against the fingerprint, so it survives address
    /// rotation. A blocked selection is cleared and noted in the shared
    /// log.
    pub async fn block_peer(&self, addr: &PeerAddress) -> Result<Contact> {
        let contact = self
            .contacts
            .get_by_address(addr)
            .await?
            .ok_or_else(|| Error::InvalidInput("unknown peer".into()))?;

        // set_blocked records both the contact flag and the
        // fingerprint mark.
        let contact = self.contacts.set_blocked(&contact.hash_id, true).await?;

        let note = Message::system(format!("blocked {}", contact.effective_name()));
        {
            let mut state = self.state.write().await;
            if state.selected.as_ref() == Some(addr) {
                state.selected = None;
            }
            state.system_log.push(note.clone());
        }

        self.emit(EngineEvent::PeerBlocked { addr: addr.clone() });
        self.emit(EngineEvent::System { text: note.content });
        Ok(contact)
    }

    /// Undo a block for the identity at `addr`.
    pub async fn unblock_peer(&self, addr: &PeerAddress) -> Result<Contact> {
        let contact = self
            .contacts
            .get_by_address(addr)
            .await?
            .ok_or_else(|| Error::InvalidInput("unknown peer".into()))?;
        self.contacts.set_blocked(&contact.hash_id, false).await
    }

    /// Block an identity that was never added as a contact, directly by
    /// fingerprint.
    pub async fn block_fingerprint(&self, fp: &crate::identity::Fingerprint) -> Result<()> {
        self.blocklist.block(fp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::VerificationMethod;
    use crate::storage::{Database, DatabaseConfig};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    /// Transport double recording every call.
    #[derive(Default)]
    struct FakeTransport {
        sessions: StdMutex<HashSet<PeerAddress>>,
        handshakes: StdMutex<Vec<PeerAddress>>,
        announces: StdMutex<Vec<PeerAddress>>,
        receipts: StdMutex<Vec<(PeerAddress, MessageId)>>,
    }

    impl MeshTransport for FakeTransport {
        fn has_session(&self, peer: &PeerAddress) -> bool {
            self.sessions.lock().unwrap().contains(peer)
        }
        fn initiate_handshake(&self, peer: &PeerAddress) -> Result<()> {
            self.handshakes.lock().unwrap().push(peer.clone());
            Ok(())
        }
        fn send_private(
            &self,
            _content: &str,
            _to: &PeerAddress,
            _nick: &str,
            _id: &MessageId,
        ) -> Result<()> {
            Ok(())
        }
        fn send_read_receipt(&self, to: &PeerAddress, id: &MessageId) -> Result<()> {
            self.receipts.lock().unwrap().push((to.clone(), id.clone()));
            Ok(())
        }
        fn send_announce(&self, to: &PeerAddress) -> Result<()> {
            self.announces.lock().unwrap().push(to.clone());
            Ok(())
        }
    }

    struct Harness {
        engine: ConversationEngine,
        transport: Arc<FakeTransport>,
        contacts: Arc<ContactStore>,
    }

    async fn harness(my_addr: &str) -> Harness {
        let config = DatabaseConfig {
            path: String::new(),
            in_memory: true,
        };
        let db = Arc::new(Mutex::new(Database::open(&config, &[0u8; 32]).expect("open")));
        let prefs = Arc::new(tokio::sync::RwLock::new(crate::config::Preferences::default()));
        let contacts = Arc::new(ContactStore::new(db.clone()).await.expect("contacts"));
        let blocklist = Blocklist::new(db.clone());
        let messages = MessageStore::new(db, prefs);
        let transport = Arc::new(FakeTransport::default());

        let engine = ConversationEngine::new(
            PeerAddress::new(my_addr),
            transport.clone(),
            contacts.clone(),
            blocklist,
            messages,
        );
        Harness {
            engine,
            transport,
            contacts,
        }
    }

    fn msg(id: &str, sender: &str, ts: i64) -> Message {
        Message {
            id: MessageId::new(id),
            sender: sender.into(),
            content: format!("{id} from {sender}"),
            timestamp: ts,
            is_private: true,
            recipient_nickname: None,
            sender_peer_address: None,
            delivery_status: DeliveryStatus::Sent,
            encrypted_blob: None,
        }
    }

    #[tokio::test]
    async fn test_sanitize_dedups_and_sorts() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("A");

        h.engine.insert_message(&addr, msg("m1", "Alice", 1000)).await;
        h.engine.insert_message(&addr, msg("m2", "Alice", 2000)).await;
        h.engine.insert_message(&addr, msg("m1", "Alice", 1000)).await;
        h.engine.sanitize(&addr).await;

        let conv = h.engine.conversation(&addr).await;
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].id.as_str(), "m1");
        assert_eq!(conv[0].timestamp, 1000);
        assert_eq!(conv[1].id.as_str(), "m2");
        assert_eq!(conv[1].timestamp, 2000);
    }

    #[tokio::test]
    async fn test_sanitize_idempotent() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("A");
        h.engine.insert_message(&addr, msg("m2", "Alice", 2000)).await;
        h.engine.insert_message(&addr, msg("m1", "Alice", 1000)).await;

        h.engine.sanitize(&addr).await;
        let once = h.engine.conversation(&addr).await;
        h.engine.sanitize(&addr).await;
        let twice = h.engine.conversation(&addr).await;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_consolidate_merges_and_transfers_unread() {
        let h = harness("00aa").await;
        let p1 = PeerAddress::new("P1");
        let p2 = PeerAddress::new("P2");

        h.engine.insert_message(&p1, msg("m1", "Alice", 1000)).await;
        h.engine.insert_message(&p2, msg("m2", "Alice", 2000)).await;
        {
            let mut state = h.engine.state.write().await;
            state.unread.insert(p1.clone());
        }

        let merged = h.engine.consolidate(&p2, "Alice").await;

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id.as_str(), "m1");
        assert_eq!(merged[1].id.as_str(), "m2");

        let addrs = h.engine.conversation_addresses().await;
        assert_eq!(addrs, vec![p2.clone()]);

        let unread = h.engine.unread_peers().await;
        assert!(unread.contains(&p2));
        assert!(!unread.contains(&p1));
    }

    #[tokio::test]
    async fn test_consolidate_idempotent() {
        let h = harness("00aa").await;
        let p1 = PeerAddress::new("P1");
        let p2 = PeerAddress::new("P2");
        h.engine.insert_message(&p1, msg("m1", "Alice", 1000)).await;
        h.engine.insert_message(&p2, msg("m2", "Alice", 2000)).await;

        let once = h.engine.consolidate(&p2, "Alice").await;
        let twice = h.engine.consolidate(&p2, "Alice").await;
        assert_eq!(once, twice);
        assert_eq!(h.engine.conversation_addresses().await, vec![p2]);
    }

    #[tokio::test]
    async fn test_consolidate_ignores_unrelated() {
        let h = harness("00aa").await;
        let p1 = PeerAddress::new("P1");
        let p2 = PeerAddress::new("P2");
        let p3 = PeerAddress::new("P3");
        h.engine.insert_message(&p1, msg("m1", "Alice", 1000)).await;
        h.engine.insert_message(&p3, msg("m3", "Carol", 3000)).await;
        h.engine.insert_message(&p2, msg("m2", "Alice", 2000)).await;

        h.engine.consolidate(&p2, "Alice").await;

        let mut addrs = h.engine.conversation_addresses().await;
        addrs.sort();
        assert_eq!(addrs, vec![p2.clone(), p3.clone()]);
        assert_eq!(h.engine.conversation(&p3).await.len(), 1);
    }

    #[tokio::test]
    async fn test_consolidate_matches_recipient_nickname() {
        let h = harness("00aa").await;
        let p1 = PeerAddress::new("P1");
        let p2 = PeerAddress::new("P2");

        let mut outbound = msg("m1", "me", 1000);
        outbound.recipient_nickname = Some("Alice".into());
        h.engine.insert_message(&p1, outbound).await;
        h.engine.insert_message(&p2, msg("m2", "Alice", 2000)).await;

        let merged = h.engine.consolidate(&p2, "Alice").await;
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn test_nostr_temp_merge() {
        let h = harness("00aa").await;
        let pk = [7u8; 32];
        let target = PeerAddress::new("feedfacefeedface");

        h.contacts
            .add_from_peer(
                &pk,
                None,
                "Niko",
                Some(target.clone()),
                false,
                VerificationMethod::Qr,
            )
            .await
            .expect("add");

        let temp = PeerAddress::nostr_temp(&hex::encode(pk));
        h.engine.insert_message(&temp, msg("m1", "Niko", 1000)).await;
        h.engine.insert_message(&target, msg("m2", "Niko", 2000)).await;

        h.engine
            .merge_nostr_conversations(&target)
            .await
            .expect("merge");

        assert_eq!(h.engine.conversation_addresses().await, vec![target.clone()]);
        assert_eq!(h.engine.conversation(&target).await.len(), 2);
    }

    #[tokio::test]
    async fn test_nostr_merge_skips_foreign_identity() {
        let h = harness("00aa").await;
        let target = PeerAddress::new("feedfacefeedface");
        // Temp conversation with an identity not bound to target.
        let temp = PeerAddress::nostr_temp(&"99".repeat(32));
        h.engine.insert_message(&temp, msg("m1", "X", 1000)).await;
        h.engine.insert_message(&target, msg("m2", "Niko", 2000)).await;

        h.engine
            .merge_nostr_conversations(&target)
            .await
            .expect("merge");

        let mut addrs = h.engine.conversation_addresses().await;
        addrs.sort();
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn test_start_private_chat_flow() {
        let h = harness("00aa").await;
        let pk = [9u8; 32];
        let addr = PeerAddress::new("0f0f0f0f0f0f0f0f");

        h.contacts
            .add_from_peer(
                &pk,
                None,
                "Mara",
                Some(addr.clone()),
                false,
                VerificationMethod::Qr,
            )
            .await
            .expect("add");

        let mut inbound = msg("m1", "Mara", 1000);
        inbound.sender_peer_address = Some(addr.clone());
        h.engine.insert_message(&addr, inbound).await;
        h.engine
            .handle_incoming(
                {
                    let mut m = msg("m1", "Mara", 1000);
                    m.sender_peer_address = Some(addr.clone());
                    m
                },
                false,
            )
            .await
            .expect("incoming");

        assert!(h.engine.unread_peers().await.contains(&addr));

        let conv = h.engine.start_private_chat(&addr).await.expect("start");
        assert_eq!(conv.len(), 1);
        assert_eq!(h.engine.selected().await, Some(addr.clone()));
        assert!(!h.engine.unread_peers().await.contains(&addr));

        // No session existed: my address "00aa" < peer address, so we
        // initiate without announcing.
        assert_eq!(h.transport.handshakes.lock().unwrap().len(), 1);
        assert!(h.transport.announces.lock().unwrap().is_empty());

        // One read receipt for the single inbound message.
        let receipts = h.transport.receipts.lock().unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].0, addr);
        assert_eq!(receipts[0].1.as_str(), "m1");
    }

    #[tokio::test]
    async fn test_handshake_tiebreak_larger_side_announces() {
        let h = harness("ffff").await;
        let addr = PeerAddress::new("0f0f0f0f0f0f0f0f");

        let _ = h.engine.start_private_chat(&addr).await.expect("start");

        assert_eq!(h.transport.announces.lock().unwrap().len(), 1);
        assert_eq!(h.transport.handshakes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_handshake_when_session_exists() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("0f0f0f0f0f0f0f0f");
        h.transport.sessions.lock().unwrap().insert(addr.clone());

        let _ = h.engine.start_private_chat(&addr).await.expect("start");

        assert!(h.transport.handshakes.lock().unwrap().is_empty());
        assert!(h.transport.announces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_peer_cannot_chat() {
        let h = harness("00aa").await;
        let pk = [3u8; 32];
        let addr = PeerAddress::new("abcdef0123456789");

        h.contacts
            .add_from_peer(
                &pk,
                None,
                "Troll",
                Some(addr.clone()),
                false,
                VerificationMethod::Manual,
            )
            .await
            .expect("add");
        h.engine.block_peer(&addr).await.expect("block");

        let err = h.engine.start_private_chat(&addr).await;
        assert!(matches!(err, Err(Error::BlockedPeer)));
        assert!(!h.engine.system_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_selected_peer_clears_selection() {
        let h = harness("00aa").await;
        let pk = [4u8; 32];
        let addr = PeerAddress::new("abcdef0123456789");

        h.contacts
            .add_from_peer(
                &pk,
                None,
                "Mallory",
                Some(addr.clone()),
                false,
                VerificationMethod::Manual,
            )
            .await
            .expect("add");

        let _ = h.engine.start_private_chat(&addr).await.expect("start");
        assert_eq!(h.engine.selected().await, Some(addr.clone()));

        h.engine.block_peer(&addr).await.expect("block");
        assert_eq!(h.engine.selected().await, None);

        // Inbound from the blocked identity is now dropped.
        let mut m = msg("mx", "Mallory", 99);
        m.sender_peer_address = Some(addr.clone());
        h.engine.handle_incoming(m, false).await.expect("incoming");
        assert!(!h.engine.unread_peers().await.contains(&addr));
    }

    #[tokio::test]
    async fn test_relay_message_attaches_to_selection() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("abcdef0123456789");
        {
            let mut state = h.engine.state.write().await;
            state.selected = Some(addr.clone());
        }

        h.engine
            .handle_incoming(msg("r1", "Remote", 500), false)
            .await
            .expect("incoming");

        let conv = h.engine.conversation(&addr).await;
        assert_eq!(conv.len(), 1);
        assert_eq!(conv[0].id.as_str(), "r1");
    }

    #[tokio::test]
    async fn test_relay_message_without_selection_dropped() {
        let h = harness("00aa").await;
        h.engine
            .handle_incoming(msg("r1", "Remote", 500), false)
            .await
            .expect("incoming");
        assert!(h.engine.conversation_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn test_suppress_unread() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("abcdef0123456789");

        let mut m = msg("m1", "Quiet", 100);
        m.sender_peer_address = Some(addr.clone());
        h.engine.handle_incoming(m, true).await.expect("incoming");

        assert!(!h.engine.unread_peers().await.contains(&addr));
    }

    #[tokio::test]
    async fn test_delivery_updates_monotone_by_id() {
        let h = harness("00aa").await;
        let addr = PeerAddress::new("A");
        let mut m = msg("m1", "me", 100);
        m.delivery_status = DeliveryStatus::Sending;
        h.engine.insert_message(&addr, m).await;

        let id = MessageId::new("m1");
        h.engine.on_delivery(&id, "Alice", 7).await;
        h.engine.update_delivery(&id, DeliveryStatus::Sent).await;

        let conv = h.engine.conversation(&addr).await;
        assert_eq!(
            conv[0].delivery_status,
            DeliveryStatus::Delivered {
                to: "Alice".into(),
                at: 7
            }
        );

        h.engine.on_read(&id, "Alice", 9).await;
        let conv = h.engine.conversation(&addr).await;
        assert_eq!(
            conv[0].delivery_status,
            DeliveryStatus::Read {
                by: "Alice".into(),
                at: 9
            }
        );
    }

    #[tokio::test]
    async fn test_observers_see_snapshots() {
        let h = harness("00aa").await;
        let mut rx = h.engine.observe_conversations();
        let addr = PeerAddress::new("A");

        h.engine.insert_message(&addr, msg("m1", "Alice", 100)).await;
        rx.changed().await.expect("snapshot");
        let snap = rx.borrow().clone();
        assert_eq!(snap.get(&addr).map(Vec::len), Some(1));
    }
}
