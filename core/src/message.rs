use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of processing a single message within a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Success,
    /// Invalidated by the message adapter. Never requeued.
    Discarded,
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Success => f.write_str("success"),
            MessageStatus::Discarded => f.write_str("discarded"),
            MessageStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Opaque broker handle used to acknowledge a delivery.
///
/// `generation` identifies the channel the delivery arrived on; delivery tags
/// are only meaningful on that channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub generation: u64,
    pub tag: u64,
}

/// A message as delivered by the broker, owned by the driver until acknowledged.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// raw payload of the message e.g. AMQP body
    pub payload: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}

impl RawMessage {
    pub fn new(payload: impl Into<Vec<u8>>, handle: DeliveryHandle) -> Self {
        Self {
            payload: payload.into(),
            redelivered: false,
            handle,
        }
    }

    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Pairs a delivered message with the outcome of processing it.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub message: RawMessage,
    pub status: MessageStatus,
}

impl StatusRecord {
    pub fn new(message: RawMessage, status: MessageStatus) -> Self {
        Self { message, status }
    }
}
