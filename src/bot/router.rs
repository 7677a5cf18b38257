//! Routing for Telegram updates: commands, mention detection, praise and
//! deferral of text messages to the generation pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::channels::{ChatKind, Message, MessageEntity, Update, User};
use crate::conversation::{ConversationStore, Mode};
use crate::error::RoutingError;
use crate::pipeline::{ChatId, GenerationJob, JobSubmitter, ReplySink, Router};

const PRAISES: &[&str] = &[
    "Nice one 👍",
    "That came out great 😎",
    "Very stylish 😏",
    "Fire 🔥",
    "Respect 👊",
];

/// Caption words that make praise much more likely.
const POSITIVE_WORDS: &[&str] = &[
    "done", "finished", "success", "works", "nailed", "сделал", "готово", "успех", "класс",
    "получилось", "супер", "отлично", "заработало",
];

const PRAISE_DELAY_MIN: Duration = Duration::from_millis(400);
const PRAISE_DELAY_MAX: Duration = Duration::from_millis(1200);

/// The bot's own account, fetched once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
}

impl From<User> for BotIdentity {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
        }
    }
}

/// Praise probabilities for photo and video messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PraisePolicy {
    pub base_chance: f64,
    pub keyword_chance: f64,
}

impl Default for PraisePolicy {
    fn default() -> Self {
        Self {
            base_chance: 0.2,
            keyword_chance: 0.9,
        }
    }
}

impl PraisePolicy {
    pub fn chance_for(&self, caption: &str) -> f64 {
        let caption = caption.to_lowercase();
        if POSITIVE_WORDS.iter().any(|w| caption.contains(w)) {
            self.keyword_chance
        } else {
            self.base_chance
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Reset,
    Mode(Option<String>),
}

/// What the router did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Command,
    Deferred,
    Praised,
    Ignored,
}

pub struct ChatRouter {
    identity: BotIdentity,
    /// Lower-cased names the bot answers to.
    names: Vec<String>,
    store: Arc<ConversationStore>,
    submitter: JobSubmitter,
    sink: Arc<dyn ReplySink>,
    praise: PraisePolicy,
}

impl ChatRouter {
    pub fn new(
        identity: BotIdentity,
        names: Vec<String>,
        store: Arc<ConversationStore>,
        submitter: JobSubmitter,
        sink: Arc<dyn ReplySink>,
        praise: PraisePolicy,
    ) -> Self {
        Self {
            identity,
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
            store,
            submitter,
            sink,
            praise,
        }
    }

    /// Route one update and report what happened.
    pub async fn dispatch(&self, update: Update) -> Result<Routed, RoutingError> {
        let Some(message) = update.message else {
            tracing::debug!(update_id = update.update_id, "Update without a message, ignoring");
            return Ok(Routed::Ignored);
        };
        let chat_id = message.chat.id;

        if let Some(command) = message.text.as_deref().and_then(|t| self.parse_command(t)) {
            self.run_command(chat_id, command).await?;
            return Ok(Routed::Command);
        }

        if !self.is_mentioned(&message) {
            return Ok(Routed::Ignored);
        }

        if message.has_photo() || message.has_video() {
            return self.maybe_praise(&message).await;
        }

        match message.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let job = GenerationJob::new(chat_id, text, message.message_id);
                self.submitter.submit(job);
                Ok(Routed::Deferred)
            }
            _ => Ok(Routed::Ignored),
        }
    }

    /// `/reset` and `/mode`, optionally suffixed with `@<this bot>`.
    fn parse_command(&self, text: &str) -> Option<Command> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let (name, target) = match head.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (head, None),
        };
        if let Some(target) = target {
            let ours = self
                .identity
                .username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(target));
            if !ours {
                return None;
            }
        }
        match name {
            "reset" => Some(Command::Reset),
            "mode" => Some(Command::Mode(parts.next().map(str::to_string))),
            _ => None,
        }
    }

    async fn run_command(&self, chat_id: ChatId, command: Command) -> Result<(), RoutingError> {
        let reply = match command {
            Command::Reset => {
                self.store.reset(chat_id).await;
                tracing::info!(chat_id, "History reset");
                "History cleared.".to_string()
            }
            Command::Mode(None) => "Usage: /mode stylish or /mode detailed".to_string(),
            Command::Mode(Some(arg)) => match arg.parse::<Mode>() {
                Ok(mode) => {
                    self.store.set_mode(chat_id, mode).await;
                    tracing::info!(chat_id, %mode, "Mode changed");
                    format!("Mode set: {mode}")
                }
                Err(_) => "Unknown mode. Use stylish or detailed.".to_string(),
            },
        };
        self.sink.deliver(chat_id, &reply, None).await?;
        Ok(())
    }

    fn is_mentioned(&self, message: &Message) -> bool {
        if message.chat.kind == ChatKind::Private {
            return true;
        }

        if let Some(username) = self.identity.username.as_deref() {
            let handle = format!("@{username}");
            let tagged = |text: &Option<String>, entities: &[MessageEntity]| {
                text.as_deref().is_some_and(|text| {
                    entities
                        .iter()
                        .filter(|e| e.kind == "mention")
                        .filter_map(|e| e.extract(text))
                        .any(|m| m.eq_ignore_ascii_case(&handle))
                })
            };
            if tagged(&message.text, message.entities.as_slice())
                || tagged(&message.caption, message.caption_entities.as_slice())
            {
                return true;
            }
        }

        let body = format!(
            "{} {}",
            message.text.as_deref().unwrap_or_default(),
            message.caption.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        if self.names.iter().any(|name| body.contains(name.as_str())) {
            return true;
        }

        message
            .reply_to_message
            .as_ref()
            .and_then(|m| m.from.as_ref())
            .is_some_and(|from| from.id == self.identity.id)
    }

    async fn maybe_praise(&self, message: &Message) -> Result<Routed, RoutingError> {
        let chance = self
            .praise
            .chance_for(message.caption.as_deref().unwrap_or_default());
        // ThreadRng is not Send; keep it out of the awaits below.
        let pick = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(chance.clamp(0.0, 1.0))).then(|| {
                let delay = rng.gen_range(PRAISE_DELAY_MIN..=PRAISE_DELAY_MAX);
                (delay, PRAISES[rng.gen_range(0..PRAISES.len())])
            })
        };
        let Some((delay, praise)) = pick else {
            return Ok(Routed::Ignored);
        };

        tokio::time::sleep(delay).await;
        self.sink.deliver(message.chat.id, praise, None).await?;
        tracing::info!(chat_id = message.chat.id, "Praise sent");
        Ok(Routed::Praised)
    }
}

#[async_trait]
impl Router for ChatRouter {
    async fn route(&self, update: Update) -> Result<(), RoutingError> {
        self.dispatch(update).await.map(|_| ())
    }
}
