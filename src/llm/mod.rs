//! Chat completion client for OpenAI-compatible endpoints.
//!
//! `ChatCompletionService` is the production `GenerationService`: it builds
//! the prompt from the persona and the conversation history, posts it to
//! `{base_url}/chat/completions` and cleans up the answer.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::bot::Persona;
use crate::config::BotConfig;
use crate::conversation::{ConversationStore, Exchange, Role};
use crate::error::ServiceError;
use crate::pipeline::{ChatId, GenerationService};

/// Reasoning models wrap their chain of thought in `<think>` tags.
static THINK_BLOCK: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Generation service backed by a `/chat/completions` endpoint.
pub struct ChatCompletionService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
    persona: Arc<Persona>,
    store: Arc<ConversationStore>,
}

impl ChatCompletionService {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        persona: Arc<Persona>,
        store: Arc<ConversationStore>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            persona,
            store,
        }
    }

    pub fn from_config(
        config: &BotConfig,
        persona: Arc<Persona>,
        store: Arc<ConversationStore>,
    ) -> Self {
        Self::new(
            config.llm_base_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
            persona,
            store,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// System prompt, then history up to this request's own user turn.
    /// Turns recorded after it belong to overlapping jobs and are left out.
    /// The request is appended when history does not hold it.
    async fn build_messages(&self, conversation_id: ChatId, request_text: &str) -> Vec<ChatMessage> {
        let mut snapshot = self.store.snapshot(conversation_id).await;
        let own_turn = snapshot
            .history
            .iter()
            .rposition(|e| e.role == Role::User && e.content == request_text);
        if let Some(index) = own_turn {
            snapshot.history.truncate(index + 1);
        }

        let mut messages = Vec::with_capacity(snapshot.history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: self.persona.system_prompt(snapshot.mode),
        });
        messages.extend(snapshot.history.into_iter().map(ChatMessage::from));
        if own_turn.is_none() {
            messages.push(ChatMessage::from(Exchange::user(request_text)));
        }
        messages
    }
}

#[async_trait]
impl GenerationService for ChatCompletionService {
    async fn generate(
        &self,
        conversation_id: ChatId,
        request_text: &str,
    ) -> Result<String, ServiceError> {
        let body = ChatRequest {
            model: &self.model,
            messages: self.build_messages(conversation_id, request_text).await,
        };
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(chat_id = conversation_id, model = %self.model, messages = body.messages.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::RequestFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("no choices in response".to_string()))?;

        let reply = strip_think(&content);
        if reply.is_empty() {
            return Err(ServiceError::InvalidResponse("empty reply".to_string()));
        }
        Ok(reply)
    }
}

/// Remove `<think>…</think>` blocks (and a dangling reasoning prefix ending
/// in `</think>`), then trim.
pub fn strip_think(text: &str) -> String {
    let stripped = THINK_BLOCK.replace_all(text, "");
    let visible = match stripped.rfind("</think>") {
        Some(end) => &stripped[end + "</think>".len()..],
        None => &stripped,
    };
    visible.trim().to_string()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

impl From<Exchange> for ChatMessage {
    fn from(exchange: Exchange) -> Self {
        Self {
            role: exchange.role.as_str(),
            content: exchange.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
