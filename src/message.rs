//! Canonical inbound message model
//!
//! Channel adapters convert platform events into a `Message` before
//! publishing onto the inbound bus. The envelope is immutable once the
//! Normalize stage has run; later stages only add enrichment fields to
//! `metadata`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of content block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text
    Text,
    /// Image file
    Image,
    /// Audio / voice note
    Audio,
    /// Video file
    Video,
    /// Sticker
    Sticker,
    /// Generic file
    File,
}

impl ContentKind {
    /// Placeholder text used when a media block carries no caption
    #[must_use]
    pub const fn placeholder(self) -> &'static str {
        match self {
            Self::Text => "",
            Self::Image => "[Image]",
            Self::Audio => "[Voice Message]",
            Self::Video => "[Video]",
            Self::Sticker => "[Sticker]",
            Self::File => "[File]",
        }
    }
}

/// One ordered content block of an inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Block kind
    pub kind: ContentKind,

    /// Text content or caption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Local path of persisted media
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Media size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// ASR transcript (audio/video)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    /// Vision description (image/sticker)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ContentBlock {
    /// Create a plain text block
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            path: None,
            mime_type: None,
            size_bytes: None,
            transcript: None,
            description: None,
        }
    }

    /// Create a media block of the given kind
    #[must_use]
    pub fn media(kind: ContentKind, path: Option<String>, mime_type: Option<String>) -> Self {
        Self {
            kind,
            text: None,
            path,
            mime_type,
            size_bytes: None,
            transcript: None,
            description: None,
        }
    }

    /// Best available text for this block: caption, transcript,
    /// description, or the kind placeholder
    #[must_use]
    pub fn effective_text(&self) -> &str {
        if let Some(text) = self.text.as_deref() {
            if !text.trim().is_empty() {
                return text;
            }
        }
        if let Some(transcript) = self.transcript.as_deref() {
            if !transcript.trim().is_empty() {
                return transcript;
            }
        }
        if let Some(desc) = self.description.as_deref() {
            if !desc.trim().is_empty() {
                return desc;
            }
        }
        self.kind.placeholder()
    }
}

/// Sender identity as supplied by the channel adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Primary platform identifier (JID, numeric id, ...)
    pub id: String,

    /// Display name, if the platform provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Secondary handle (e.g. Telegram @username)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Identity {
    /// Create an identity with just an id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            handle: None,
        }
    }

    /// Display name if present, otherwise the raw id
    #[must_use]
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Reference to a quoted / replied-to message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyRef {
    /// Platform id of the quoted message
    pub message_id: String,

    /// Quoted text, when the platform payload carries it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Author of the quoted message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Immutable inbound message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Platform message id
    pub id: String,

    /// Originating channel tag ("whatsapp", "telegram", ...)
    pub channel: String,

    /// Opaque conversation id within the channel
    pub chat_id: String,

    /// Sender identity
    pub sender: Identity,

    /// Ordered content blocks
    pub content: Vec<ContentBlock>,

    /// Quoted message, when replying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,

    /// Arrival timestamp (UTC)
    pub timestamp: DateTime<Utc>,

    /// Whether the chat is a group
    pub is_group: bool,

    /// Whether the bot was @-mentioned
    #[serde(default)]
    pub mentioned_bot: bool,

    /// Whether the message replies to one of the bot's messages
    #[serde(default)]
    pub reply_to_bot: bool,

    /// Channel-specific participant id (group sender JID etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,

    /// Open enrichment bag (transcripts, context windows, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a text message (the common case in tests and adapters)
    #[must_use]
    pub fn text(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        id: impl Into<String>,
        sender: Identity,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender,
            content: vec![ContentBlock::text(text)],
            reply_to: None,
            timestamp: Utc::now(),
            is_group: false,
            mentioned_bot: false,
            reply_to_bot: false,
            participant: None,
            metadata: Map::new(),
        }
    }

    /// Concatenated text of all blocks, media blocks rendered via their
    /// effective text
    #[must_use]
    pub fn text_content(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .map(ContentBlock::effective_text)
            .filter(|t| !t.is_empty())
            .collect();
        parts.join("\n")
    }

    /// Whether any block is a voice note
    #[must_use]
    pub fn is_voice(&self) -> bool {
        self.content.iter().any(|b| b.kind == ContentKind::Audio)
    }

    /// First ASR transcript found in the content blocks
    #[must_use]
    pub fn transcript(&self) -> Option<&str> {
        self.content.iter().find_map(|b| b.transcript.as_deref())
    }

    /// Read a string enrichment field from metadata
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_joins_blocks() {
        let mut msg = Message::text("telegram", "c1", "m1", Identity::new("u1"), "hello");
        msg.content
            .push(ContentBlock::media(ContentKind::Image, None, None));
        assert_eq!(msg.text_content(), "hello\n[Image]");
    }

    #[test]
    fn effective_text_prefers_transcript_over_placeholder() {
        let mut block = ContentBlock::media(ContentKind::Audio, None, None);
        assert_eq!(block.effective_text(), "[Voice Message]");
        block.transcript = Some("turn on the lights".to_string());
        assert_eq!(block.effective_text(), "turn on the lights");
    }

    #[test]
    fn voice_detection() {
        let mut msg = Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "");
        assert!(!msg.is_voice());
        msg.content
            .push(ContentBlock::media(ContentKind::Audio, None, None));
        assert!(msg.is_voice());
    }
}
