//! Message types and delivery-status handling.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::PeerAddress;

/// Unique identifier for a message (UUID-style string).
///
/// Lexicographic ordering is used as the tie-break when trimming capped
/// conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message delivery/read status.
///
/// Transitions are monotone: `Sending → Sent → PartiallyDelivered →
/// Delivered → Read`. `Failed` is terminal and only overrides
/// `Sending`/`Sent`. Backward transitions are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Message is being sent.
    Sending,
    /// Message handed to the transport, not yet confirmed.
    Sent,
    /// Message confirmed delivered to the recipient's device.
    Delivered {
        /// Who confirmed delivery.
        to: String,
        /// Confirmation time (Unix millis).
        at: i64,
    },
    /// Message read by the recipient.
    Read {
        /// Who read it.
        by: String,
        /// Read time (Unix millis).
        at: i64,
    },
    /// Message failed to send. Terminal.
    Failed {
        /// Failure reason.
        reason: String,
    },
    /// Best-effort broadcast reached only part of the recipients.
    PartiallyDelivered {
        /// Number of recipients reached.
        reached: u32,
        /// Total recipients attempted.
        total: u32,
    },
}

impl DeliveryStatus {
    /// On-disk encoding: colon-separated, human-greppable.
    pub fn encode(&self) -> String {
        match self {
            Self::Sending => "sending".to_string(),
            Self::Sent => "sent".to_string(),
            Self::Delivered { to, at } => format!("delivered:{to}:{at}"),
            Self::Read { by, at } => format!("read:{by}:{at}"),
            Self::Failed { reason } => format!("failed:{reason}"),
            Self::PartiallyDelivered { reached, total } => format!("partial:{reached}:{total}"),
        }
    }

    /// Decode the on-disk form.
    ///
    /// Nicknames may themselves contain colons, so the trailing numeric
    /// field is split off from the right.
    pub fn decode(s: &str) -> Result<Self> {
        if s == "sending" {
            return Ok(Self::Sending);
        }
        if s == "sent" {
            return Ok(Self::Sent);
        }
        if let Some(rest) = s.strip_prefix("delivered:") {
            let (to, at) = split_name_millis(rest)?;
            return Ok(Self::Delivered { to, at });
        }
        if let Some(rest) = s.strip_prefix("read:") {
            let (by, at) = split_name_millis(rest)?;
            return Ok(Self::Read { by, at });
        }
        if let Some(reason) = s.strip_prefix("failed:") {
            return Ok(Self::Failed {
                reason: reason.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("partial:") {
            let (reached, total) = rest
                .split_once(':')
                .ok_or_else(|| Error::Encoding("malformed partial status".into()))?;
            let reached = reached
                .parse()
                .map_err(|_| Error::Encoding("malformed partial status".into()))?;
            let total = total
                .parse()
                .map_err(|_| Error::Encoding("malformed partial status".into()))?;
            return Ok(Self::PartiallyDelivered { reached, total });
        }
        Err(Error::Encoding(format!(
            "unknown delivery status: {}",
            crate::logging::sanitize_for_log(s)
        )))
    }

    /// Progress rank for the monotone transition rule.
    fn rank(&self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::PartiallyDelivered { .. } => 2,
            Self::Delivered { .. } => 3,
            Self::Read { .. } => 4,
            Self::Failed { .. } => 5,
        }
    }

    /// Whether `next` is an acceptable transition from `self`.
    pub fn allows(&self, next: &DeliveryStatus) -> bool {
        match (self, next) {
            // Failed is terminal.
            (Self::Failed { .. }, _) => false,
            // Failure only overrides not-yet-delivered states.
            (_, Self::Failed { .. }) => self.rank() <= 1,
            // Otherwise strictly forward.
            _ => next.rank() > self.rank(),
        }
    }
}

fn split_name_millis(rest: &str) -> Result<(String, i64)> {
    let (name, millis) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::Encoding("malformed delivery status".into()))?;
    let at = millis
        .parse()
        .map_err(|_| Error::Encoding("malformed delivery timestamp".into()))?;
    Ok((name.to_string(), at))
}

/// A complete message with metadata.
///
/// Messages are append-only; after creation only `delivery_status` may
/// change, and only forward along the transition DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sender display name.
    pub sender: String,
    /// Message content.
    pub content: String,
    /// Unix timestamp (milliseconds).
    pub timestamp: i64,
    /// Whether this is a private (directed) message.
    pub is_private: bool,
    /// Recipient nickname for private messages.
    pub recipient_nickname: Option<String>,
    /// Originating transport address, when the message came in over the
    /// mesh. Relay-origin messages carry `None`.
    pub sender_peer_address: Option<PeerAddress>,
    /// Delivery status.
    pub delivery_status: DeliveryStatus,
    /// Original ciphertext, kept when the payload could not (yet) be
    /// decrypted.
    pub encrypted_blob: Option<Vec<u8>>,
}

impl Message {
    /// Create a new outgoing private message in `Sending` state.
    pub fn outgoing_private(
        content: impl Into<String>,
        sender: impl Into<String>,
        recipient_nickname: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::fresh(),
            sender: sender.into(),
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_private: true,
            recipient_nickname: Some(recipient_nickname.into()),
            sender_peer_address: None,
            delivery_status: DeliveryStatus::Sending,
            encrypted_blob: None,
        }
    }

    /// Create an inbound message received from `from`.
    pub fn incoming(
        content: impl Into<String>,
        sender: impl Into<String>,
        from: PeerAddress,
        timestamp: i64,
    ) -> Self {
        Self {
            id: MessageId::fresh(),
            sender: sender.into(),
            content: content.into(),
            timestamp,
            is_private: true,
            recipient_nickname: None,
            sender_peer_address: Some(from),
            delivery_status: DeliveryStatus::Sent,
            encrypted_blob: None,
        }
    }

    /// Create a system message for the shared chat log.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::fresh(),
            sender: "system".to_string(),
            content: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_private: false,
            recipient_nickname: None,
            sender_peer_address: None,
            delivery_status: DeliveryStatus::Sent,
            encrypted_blob: None,
        }
    }

    /// Apply a delivery-status update under the monotone rule. Returns
    /// whether the update was accepted.
    pub fn apply_status(&mut self, next: DeliveryStatus) -> bool {
        if self.delivery_status.allows(&next) {
            self.delivery_status = next;
            true
        } else {
            tracing::debug!(
                id = %self.id,
                current = %self.delivery_status.encode(),
                ignored = %next.encode(),
                "Ignoring backward delivery-status transition"
            );
            false
        }
    }
}
