//! Typed subset of the Telegram Bot API `Update` object.
//!
//! Only the fields the router looks at are modelled; everything else in the
//! payload is ignored by serde.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub caption_entities: Vec<MessageEntity>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub video: Option<serde_json::Value>,
}

impl Message {
    pub fn has_photo(&self) -> bool {
        self.photo.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Entity offsets and lengths are in UTF-16 code units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    /// Slice the entity out of `text`, honouring UTF-16 offsets.
    pub fn extract(&self, text: &str) -> Option<String> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let end = self.offset.checked_add(self.length)?;
        let slice = units.get(self.offset..end)?;
        String::from_utf16(slice).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_extract_ascii() {
        let entity = MessageEntity {
            kind: "mention".into(),
            offset: 4,
            length: 9,
        };
        assert_eq!(entity.extract("hey @relaybot!").as_deref(), Some("@relaybot"));
    }

    #[test]
    fn entity_extract_after_emoji_uses_utf16_offsets() {
        // "🔥" is two UTF-16 code units.
        let text = "🔥 @bot hi";
        let entity = MessageEntity {
            kind: "mention".into(),
            offset: 3,
            length: 4,
        };
        assert_eq!(entity.extract(text).as_deref(), Some("@bot"));
    }

    #[test]
    fn entity_out_of_range_is_none() {
        let entity = MessageEntity {
            kind: "mention".into(),
            offset: 10,
            length: 5,
        };
        assert!(entity.extract("short").is_none());
    }

    #[test]
    fn media_detection() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "message_id": 1,
            "chat": {"id": 1, "type": "private"},
            "photo": [{"file_id": "a", "width": 1, "height": 1}]
        }))
        .unwrap();
        assert!(msg.has_photo());
        assert!(!msg.has_video());
    }
}
