//! Idea/backlog capture stage
//!
//! Messages whose first token (accent-folded, case-insensitive) is a
//! configured intent word — or that start with an explicit marker like
//! `[idea]` / `#backlog` — are captured straight to memory with a
//! confirmation reaction, bypassing the responder entirely.

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::intents::{CaptureScope, OrchestratorIntent};
use crate::Result;

const IDEA_MARKERS: &[&str] = &["[idea]", "#idea", "idea:"];
const BACKLOG_MARKERS: &[&str] = &["[backlog]", "#backlog", "backlog:", "[todo]", "#todo", "todo:"];

/// Capture kind detected from the message prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// An idea for the inbox
    Idea,
    /// A backlog / todo item
    Backlog,
}

impl CaptureKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Idea => "idea",
            Self::Backlog => "backlog",
        }
    }

    const fn emoji(self) -> &'static str {
        match self {
            Self::Idea => "💡",
            Self::Backlog => "📌",
        }
    }
}

/// Explicit capture interception
pub struct IdeaCapture {
    idea_words: Vec<String>,
    backlog_words: Vec<String>,
}

impl IdeaCapture {
    /// Create the stage with configured intent words
    #[must_use]
    pub fn new(idea_words: Vec<String>, backlog_words: Vec<String>) -> Self {
        Self {
            idea_words: idea_words.iter().map(|w| fold_accents(w)).collect(),
            backlog_words: backlog_words.iter().map(|w| fold_accents(w)).collect(),
        }
    }

    /// Classify a message text; returns the kind and the capture body
    #[must_use]
    pub fn classify(&self, text: &str) -> Option<(CaptureKind, String)> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lowered = trimmed.to_lowercase();

        for marker in BACKLOG_MARKERS {
            if lowered.starts_with(marker) {
                return Some((CaptureKind::Backlog, strip_body(trimmed, marker.len())));
            }
        }
        for marker in IDEA_MARKERS {
            if lowered.starts_with(marker) {
                return Some((CaptureKind::Idea, strip_body(trimmed, marker.len())));
            }
        }

        let first_token: String = trimmed
            .chars()
            .take_while(|c| c.is_alphanumeric())
            .collect();
        if first_token.is_empty() {
            return None;
        }
        let folded = fold_accents(&first_token.to_lowercase());

        let kind = if self.backlog_words.contains(&folded) {
            CaptureKind::Backlog
        } else if self.idea_words.contains(&folded) {
            CaptureKind::Idea
        } else {
            return None;
        };

        Some((kind, strip_body(trimmed, first_token.len())))
    }
}

fn strip_body(text: &str, prefix_len: usize) -> String {
    let body = text[prefix_len..].trim_start_matches([' ', '\t', ':', ';', '.', ',', '-']);
    if body.is_empty() {
        text.to_string()
    } else {
        body.to_string()
    }
}

fn fold_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            other => other,
        })
        .collect()
}

#[async_trait]
impl Middleware for IdeaCapture {
    fn name(&self) -> &'static str {
        "idea_capture"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        if ctx
            .decision
            .as_ref()
            .is_some_and(|decision| !decision.accept_message)
        {
            return next.run(ctx).await;
        }

        let text = ctx.event.text_content();
        let Some((kind, body)) = self.classify(&text) else {
            return next.run(ctx).await;
        };

        ctx.intents.push(OrchestratorIntent::MemoryCapture {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_id: Some(ctx.event.sender.id.clone()),
            message_id: Some(ctx.event.id.clone()),
            text: body,
            kind: kind.as_str().to_string(),
            scope: CaptureScope::Chat,
            assistant: false,
        });

        if !ctx.event.id.is_empty() {
            ctx.intents.push(OrchestratorIntent::Reaction {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                message_id: ctx.event.id.clone(),
                emoji: kind.emoji().to_string(),
                participant: ctx.event.participant.clone(),
            });
        }

        ctx.metric(
            "idea_capture_saved",
            vec![
                ("channel".to_string(), ctx.event.channel.clone()),
                ("kind".to_string(), kind.as_str().to_string()),
            ],
        );
        ctx.halt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message};
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn stage() -> IdeaCapture {
        IdeaCapture::new(
            vec!["idea".to_string(), "idee".to_string(), "ideia".to_string()],
            vec!["backlog".to_string(), "todo".to_string()],
        )
    }

    #[test]
    fn classify_first_token_variants() {
        let s = stage();
        assert_eq!(
            s.classify("Idea: solar balcony"),
            Some((CaptureKind::Idea, "solar balcony".to_string()))
        );
        assert_eq!(
            s.classify("Idée solar balcony").map(|(k, _)| k),
            Some(CaptureKind::Idea)
        );
        assert_eq!(
            s.classify("todo water the plants"),
            Some((CaptureKind::Backlog, "water the plants".to_string()))
        );
        assert!(s.classify("I had an idea yesterday").is_none());
    }

    #[test]
    fn classify_markers() {
        let s = stage();
        assert_eq!(
            s.classify("[backlog] fix the door"),
            Some((CaptureKind::Backlog, "fix the door".to_string()))
        );
        assert_eq!(
            s.classify("#idea garden lights"),
            Some((CaptureKind::Idea, "garden lights".to_string()))
        );
    }

    #[tokio::test]
    async fn capture_emits_memory_and_reaction_then_halts() {
        let pipeline = Pipeline::new(vec![Arc::new(stage())]);
        let intents = pipeline
            .run(Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "idea solar balcony"))
            .await;

        assert!(intents.iter().any(|i| matches!(
            i,
            OrchestratorIntent::MemoryCapture { kind, .. } if kind == "idea"
        )));
        assert!(intents.iter().any(|i| matches!(
            i,
            OrchestratorIntent::Reaction { emoji, .. } if emoji == "💡"
        )));
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let pipeline = Pipeline::new(vec![Arc::new(stage())]);
        let intents = pipeline
            .run(Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "how are you"))
            .await;
        assert!(intents.is_empty());
    }
}
