//! Telegram I/O: typed inbound updates and the outbound Bot API client.

pub mod telegram;
pub mod update;

pub use telegram::TelegramApi;
pub use update::{Chat, ChatKind, Message, MessageEntity, PhotoSize, Update, User};
