//! Private-chat conversation layer.
//!
//! [`message`] holds the message model, [`engine`] the in-memory
//! conversation state, and [`pipeline`] the single-writer send queue.

pub mod engine;
pub mod message;
pub mod pipeline;

pub use engine::{ConversationEngine, EngineEvent};
pub use message::{DeliveryStatus, Message, MessageId};
pub use pipeline::{SendPipeline, SendRequest};
