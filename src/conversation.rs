//! Per-conversation state with per-key serialized mutation.
//!
//! Each conversation id maps to its own `Mutex<ConversationState>`; the outer
//! `RwLock` only guards the map itself, so workers handling different chats
//! never contend, and two workers on the same chat take turns.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::pipeline::ChatId;

/// Who produced an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub role: Role,
    pub content: String,
}

impl Exchange {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Reply style for a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Short, natural replies.
    #[default]
    Stylish,
    /// Long, thorough replies.
    Detailed,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stylish => write!(f, "stylish"),
            Self::Detailed => write!(f, "detailed"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stylish" => Ok(Self::Stylish),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Mutable context for a single conversation.
#[derive(Debug, Clone)]
pub struct ConversationState {
    history: VecDeque<Exchange>,
    max_history: usize,
    pub mode: Mode,
}

impl ConversationState {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history,
            mode: Mode::default(),
        }
    }

    /// Append an exchange, evicting the oldest entries past the cap.
    pub fn push(&mut self, exchange: Exchange) {
        self.history.push_back(exchange);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &Exchange> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Back to an empty history in the default mode.
    pub fn reset(&mut self) {
        self.history.clear();
        self.mode = Mode::default();
    }
}

/// Read-only copy of a conversation taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub mode: Mode,
    pub history: Vec<Exchange>,
}

/// Process-lifetime store of conversation state, keyed by chat id.
pub struct ConversationStore {
    conversations: RwLock<HashMap<ChatId, Arc<Mutex<ConversationState>>>>,
    max_history: usize,
}

impl ConversationStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    /// The per-conversation cell, created on first reference.
    pub async fn get_or_create(&self, id: ChatId) -> Arc<Mutex<ConversationState>> {
        if let Some(cell) = self.conversations.read().await.get(&id) {
            return Arc::clone(cell);
        }
        let mut conversations = self.conversations.write().await;
        Arc::clone(
            conversations
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(ConversationState::new(self.max_history)))),
        )
    }

    /// Run `f` with exclusive access to one conversation.
    pub async fn mutate<F, R>(&self, id: ChatId, f: F) -> R
    where
        F: FnOnce(&mut ConversationState) -> R,
    {
        let cell = self.get_or_create(id).await;
        let mut state = cell.lock().await;
        f(&mut state)
    }

    pub async fn append(&self, id: ChatId, exchange: Exchange) {
        self.mutate(id, |state| state.push(exchange)).await;
    }

    pub async fn set_mode(&self, id: ChatId, mode: Mode) {
        self.mutate(id, |state| state.mode = mode).await;
    }

    pub async fn snapshot(&self, id: ChatId) -> ConversationSnapshot {
        self.mutate(id, |state| ConversationSnapshot {
            mode: state.mode,
            history: state.history().cloned().collect(),
        })
        .await
    }

    pub async fn reset(&self, id: ChatId) {
        self.mutate(id, ConversationState::reset).await;
    }

    /// Number of conversations seen so far.
    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}
