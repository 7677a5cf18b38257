//! Items that travel through the pipeline queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::Update;
use crate::error::DecodeError;

/// Conversation identifier (Telegram chat id).
pub type ChatId = i64;

/// An inbound notification exactly as delivered, plus its sequence number.
///
/// Moved into the inbound queue by value and consumed by exactly one
/// dispatch worker; nothing mutates it in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub sequence: i64,
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Wrap a webhook body, taking the sequence number from `update_id`
    /// (`-1` when absent; the decoder will reject such payloads).
    pub fn from_payload(payload: serde_json::Value) -> Self {
        let sequence = payload
            .get("update_id")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1);
        Self { sequence, payload }
    }

    /// Decode into a typed update.
    pub fn decode(self) -> Result<Update, DecodeError> {
        let sequence = self.sequence;
        serde_json::from_value(self.payload).map_err(|e| DecodeError {
            sequence,
            reason: e.to_string(),
        })
    }
}

/// A deferred request for generated text, answered as a reply to `reply_to`.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub conversation_id: ChatId,
    pub request_text: String,
    pub reply_to: i64,
    pub created_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(conversation_id: ChatId, request_text: impl Into<String>, reply_to: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            request_text: request_text.into(),
            reply_to,
            created_at: Utc::now(),
        }
    }
}
