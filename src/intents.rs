//! Intents emitted by the orchestration pipeline
//!
//! Every pipeline execution returns a list of declarative intents. The
//! orchestrator dispatches them: outbound messages and reactions go to
//! the owning channel adapter, memory captures to the background memory
//! lane, metrics to the telemetry sink.

use serde::{Deserialize, Serialize};

/// Typing indicator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    /// Show typing indicator
    On,
    /// Clear typing indicator
    Off,
}

/// Memory capture scope hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureScope {
    /// Scoped to the originating chat
    Chat,
    /// Scoped to the sender
    User,
    /// Workspace-global
    Global,
}

/// Declarative action produced by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorIntent {
    /// Deliver one outbound text message
    OutboundText {
        channel: String,
        chat_id: String,
        text: String,
        /// Message id to thread under, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// Deliver one outbound media message
    OutboundMedia {
        channel: String,
        chat_id: String,
        /// Local path of the media file
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// React to a specific message with an emoji
    Reaction {
        channel: String,
        chat_id: String,
        message_id: String,
        emoji: String,
        /// Group participant the reacted message belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant: Option<String>,
    },

    /// Toggle the typing indicator
    Typing {
        channel: String,
        chat_id: String,
        state: TypingState,
    },

    /// Queue text for background memory capture
    MemoryCapture {
        channel: String,
        chat_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        text: String,
        /// Capture kind hint ("idea", "backlog", "turn", ...)
        kind: String,
        scope: CaptureScope,
        /// Whether the text came from the assistant rather than a user
        #[serde(default)]
        assistant: bool,
    },

    /// Emit one structured counter metric
    MetricEvent {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        value: i64,
    },
}

impl OrchestratorIntent {
    /// Counter metric with value 1
    #[must_use]
    pub fn metric(name: impl Into<String>, labels: Vec<(String, String)>) -> Self {
        Self::MetricEvent {
            name: name.into(),
            labels,
            value: 1,
        }
    }

    /// Whether this intent produces user-visible channel output
    #[must_use]
    pub const fn is_outbound(&self) -> bool {
        matches!(
            self,
            Self::OutboundText { .. } | Self::OutboundMedia { .. } | Self::Reaction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_round_trip() {
        let intent = OrchestratorIntent::OutboundText {
            channel: "whatsapp".to_string(),
            chat_id: "123@g.us".to_string(),
            text: "hi".to_string(),
            reply_to: Some("m1".to_string()),
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert!(json.contains("\"type\":\"outbound_text\""));
        let back: OrchestratorIntent = serde_json::from_str(&json).unwrap();
        assert!(back.is_outbound());
    }

    #[test]
    fn metric_is_not_outbound() {
        let m = OrchestratorIntent::metric("event_drop_empty", vec![]);
        assert!(!m.is_outbound());
    }
}
