//! Persona text and system prompt assembly.

use std::path::Path;

use crate::conversation::Mode;
use crate::error::ConfigError;

/// Style description the bot imitates.
#[derive(Debug, Clone, Default)]
pub struct Persona {
    style: String,
}

impl Persona {
    pub fn new(style: impl Into<String>) -> Self {
        Self {
            style: style.into(),
        }
    }

    /// Read the persona file. A missing file yields an empty persona.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(style) => {
                tracing::info!(path = %path.display(), chars = style.chars().count(), "Persona loaded");
                Ok(Self::new(style.trim()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Persona file not found, using an empty persona");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn style(&self) -> &str {
        &self.style
    }

    /// System prompt for a conversation in `mode`.
    pub fn system_prompt(&self, mode: Mode) -> String {
        let mut prompt = String::from("You are me. Talk the way I talk.\n");
        if !self.style.is_empty() {
            prompt.push_str("My style:\n");
            prompt.push_str(&self.style);
            prompt.push('\n');
        }
        prompt.push_str(match mode {
            Mode::Stylish => "Answer briefly and naturally, the way I would say it.",
            Mode::Detailed => "Answer thoroughly and in detail.",
        });
        prompt
    }
}
