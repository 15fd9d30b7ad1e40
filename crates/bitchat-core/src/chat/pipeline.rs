//! Single-writer send pipeline.
//!
//! All outbound sends for a peer flow through one FIFO queue drained by
//! one worker task, so a user rapidly tapping "send" cannot produce
//! duplicates, out-of-order status, or interleaved handshakes. Distinct
//! peers are served by distinct workers in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chat::engine::ConversationEngine;
use crate::chat::message::{DeliveryStatus, Message, MessageId};
use crate::error::{Error, Result};
use crate::identity::PeerAddress;
use crate::logging::RedactedAddr;
use crate::transport::MeshTransport;

/// Bounded depth of each per-peer queue; saturation surfaces as
/// [`Error::Backpressure`].
pub const SEND_QUEUE_DEPTH: usize = 100;

/// A request to send one private message.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Message text.
    pub content: String,
    /// Destination peer.
    pub peer_addr: PeerAddress,
    /// Recipient nickname, when known.
    pub recipient_nickname: Option<String>,
    /// Our nickname as shown to the recipient.
    pub sender_nickname: Option<String>,
}

/// The single-writer send pipeline.
pub struct SendPipeline {
    engine: Arc<ConversationEngine>,
    transport: Arc<dyn MeshTransport>,
    workers: Mutex<HashMap<PeerAddress, mpsc::Sender<SendRequest>>>,
    shutting_down: AtomicBool,
}

impl SendPipeline {
    /// Create a pipeline over the engine and transport seams.
    pub fn new(engine: Arc<ConversationEngine>, transport: Arc<dyn MeshTransport>) -> Self {
        Self {
            engine,
            transport,
            workers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Enqueue a send request. Within one peer, requests are processed
    /// strictly in submission order.
    pub async fn submit(&self, req: SendRequest) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let mut workers = self.workers.lock().await;
        let tx = workers
            .entry(req.peer_addr.clone())
            .or_insert_with(|| self.spawn_worker(req.peer_addr.clone()));

        match tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }

    fn spawn_worker(&self, peer: PeerAddress) -> mpsc::Sender<SendRequest> {
        let (tx, mut rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let engine = self.engine.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            debug!(peer = %RedactedAddr(peer.as_str()), "Send worker started");
            while let Some(req) = rx.recv().await {
                Self::process(&engine, transport.as_ref(), req).await;
            }
            debug!(peer = %RedactedAddr(peer.as_str()), "Send worker stopped");
        });

        tx
    }

    /// Turn one request into a visible `Sending` message and hand it to
    /// the transport. The transport returns once the packet is queued;
    /// delivery and read callbacks advance the status later, by id.
    async fn process(engine: &ConversationEngine, transport: &dyn MeshTransport, req: SendRequest) {
        let msg = Message {
            id: MessageId::fresh(),
            sender: req.sender_nickname.unwrap_or_else(|| "me".to_string()),
            content: req.content,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_private: true,
            recipient_nickname: req.recipient_nickname,
            sender_peer_address: None,
            delivery_status: DeliveryStatus::Sending,
            encrypted_blob: None,
        };

        engine.insert_message(&req.peer_addr, msg.clone()).await;

        let nickname = msg.recipient_nickname.as_deref().unwrap_or_default();
        if let Err(e) = transport.send_private(&msg.content, &req.peer_addr, nickname, &msg.id) {
            warn!(
                error = %e,
                peer = %RedactedAddr(req.peer_addr.as_str()),
                "Transport rejected outbound message"
            );
            engine
                .update_delivery(
                    &msg.id,
                    DeliveryStatus::Failed {
                        reason: e.to_string(),
                    },
                )
                .await;
        }
    }

    /// Stop accepting sends. In-flight requests finish; subsequent
    /// submissions fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Dropping the senders lets each worker drain and exit.
        self.workers.lock().await.clear();
    }
}
