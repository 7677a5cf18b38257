//! Reply Relay: a Telegram webhook bot built on a bounded ingestion and
//! dispatch pipeline.

pub mod bot;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod keep_alive;
pub mod llm;
pub mod pipeline;
pub mod server;
