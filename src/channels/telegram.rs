//! Telegram Bot API client: outbound calls for the webhook bot.
//!
//! Updates arrive through the webhook (see `server`); this module covers
//! everything sent the other way: replies, chat actions, identity and
//! webhook registration.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::channels::User;
use crate::error::DeliveryError;
use crate::pipeline::{ChatId, ReplySink};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Per-request limit for every Bot API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope every Bot API method answers with.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Thin Bot API client.
pub struct TelegramApi {
    token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Point the client at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.token.expose_secret()
        )
    }

    /// POST a method call and unwrap the `{ok, result}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, DeliveryError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            // The URL carries the bot token; keep it out of error text.
            .map_err(|e| DeliveryError::Http(format!("{method}: {}", e.without_url())))?;

        let status = resp.status();
        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Http(format!("{method}: {status}: {}", e.without_url())))?;

        match parsed {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(DeliveryError::Http(format!(
                "{method} failed ({status}): {}",
                description.unwrap_or_else(|| "no description".to_string())
            ))),
        }
    }

    /// The bot's own identity.
    pub async fn get_me(&self) -> Result<User, DeliveryError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    pub async fn set_webhook(&self, url: &str) -> Result<(), DeliveryError> {
        self.call::<bool>("setWebhook", &serde_json::json!({ "url": url }))
            .await
            .map(|_| ())
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), DeliveryError> {
        self.call::<bool>(
            "deleteWebhook",
            &serde_json::json!({ "drop_pending_updates": drop_pending_updates }),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_chat_action(&self, chat_id: ChatId, action: &str) -> Result<(), DeliveryError> {
        self.call::<bool>(
            "sendChatAction",
            &serde_json::json!({ "chat_id": chat_id, "action": action }),
        )
        .await
        .map(|_| ())
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Long texts are split; only the first chunk is threaded under `reply_to`.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        for (i, chunk) in chunks.iter().enumerate() {
            let reply_to = if i == 0 { reply_to } else { None };
            self.send_message_chunk(chat_id, chunk, reply_to).await?;
        }
        Ok(())
    }

    async fn send_message_chunk(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = serde_json::json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }

        let markdown_err = match self.call::<serde_json::Value>("sendMessage", &body).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(
            chat_id,
            error = %markdown_err,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        if let Some(fields) = body.as_object_mut() {
            fields.remove("parse_mode");
        }
        self.call::<serde_json::Value>("sendMessage", &body)
            .await
            .map(|_| ())
            .map_err(|plain_err| DeliveryError::SendFailed {
                chat_id,
                reason: format!("markdown: {markdown_err}; plain: {plain_err}"),
            })
    }
}

#[async_trait]
impl ReplySink for TelegramApi {
    async fn deliver(
        &self,
        conversation_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError> {
        self.send_message(conversation_id, text, reply_to).await
    }

    async fn typing(&self, conversation_id: ChatId) -> Result<(), DeliveryError> {
        self.send_chat_action(conversation_id, "typing").await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Split a message into chunks of at most `max_len` bytes.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Splitting at 0 would loop forever
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
