//! Reply-context enrichment stage
//!
//! Builds two context sub-blocks and stores them in `event.metadata`:
//!
//! - `reply_context_window`: the reply chain walked backward from the
//!   quoted message, most-recent-first, capped at a configurable depth.
//!   Only built when the event is a reply.
//! - `ambient_context_window`: the last N archived messages of the same
//!   chat, oldest-first. Built for group chats.
//!
//! Window lines carry the sender display name, truncated text, and
//! timestamp.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Middleware, Next, PipelineContext};
use crate::archive::{ArchiveRecord, InboundArchive};
use crate::Result;

/// Metadata key for the reply-thread window
pub const REPLY_WINDOW_KEY: &str = "reply_context_window";

/// Metadata key for the ambient window
pub const AMBIENT_WINDOW_KEY: &str = "ambient_context_window";

/// Metadata key recording where the quoted text came from
pub const SOURCE_KEY: &str = "reply_context_source";

/// Context window builder
pub struct ReplyContextEnrich {
    archive: InboundArchive,
    reply_window_limit: usize,
    ambient_window_limit: usize,
    line_max_chars: usize,
}

impl ReplyContextEnrich {
    /// Create the stage
    #[must_use]
    pub fn new(
        archive: InboundArchive,
        reply_window_limit: usize,
        ambient_window_limit: usize,
        line_max_chars: usize,
    ) -> Self {
        Self {
            archive,
            reply_window_limit: reply_window_limit.max(1),
            ambient_window_limit,
            line_max_chars: line_max_chars.max(32),
        }
    }

    fn record_to_line(&self, record: &ArchiveRecord) -> Value {
        let compact = record.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let truncated: String = if compact.chars().count() > self.line_max_chars {
            let mut t: String = compact.chars().take(self.line_max_chars).collect();
            t.push_str("...");
            t
        } else {
            compact
        };
        json!({
            "sender": record
                .sender_display_name
                .clone()
                .unwrap_or_else(|| record.sender_id.clone()),
            "text": truncated,
            "timestamp": record.timestamp.to_rfc3339(),
        })
    }

    fn build_reply_window(&self, ctx: &PipelineContext) -> Result<Vec<Value>> {
        let Some(ref reply) = ctx.event.reply_to else {
            return Ok(Vec::new());
        };
        let chain = self.archive.walk_reply_chain(
            &ctx.event.channel,
            &ctx.event.chat_id,
            &reply.message_id,
            self.reply_window_limit,
        )?;
        Ok(chain.iter().map(|r| self.record_to_line(r)).collect())
    }

    fn build_ambient_window(&self, ctx: &PipelineContext) -> Result<Vec<Value>> {
        if !ctx.event.is_group || self.ambient_window_limit == 0 {
            return Ok(Vec::new());
        }
        let before = self.archive.lookup_messages_before(
            &ctx.event.channel,
            &ctx.event.chat_id,
            &ctx.event.id,
            self.ambient_window_limit,
        )?;
        Ok(before.iter().map(|r| self.record_to_line(r)).collect())
    }
}

#[async_trait]
impl Middleware for ReplyContextEnrich {
    fn name(&self) -> &'static str {
        "reply_context"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        match self.build_reply_window(ctx) {
            Ok(window) if !window.is_empty() => {
                ctx.event
                    .metadata
                    .insert(REPLY_WINDOW_KEY.to_string(), Value::Array(window));
                ctx.event
                    .metadata
                    .entry(SOURCE_KEY.to_string())
                    .or_insert_with(|| Value::String("archive".to_string()));
                ctx.channel_metric("reply_ctx_archive_hit");
            }
            Ok(_) => {
                if ctx.event.reply_to.is_some() {
                    ctx.channel_metric("reply_ctx_archive_miss");
                    if ctx
                        .event
                        .reply_to
                        .as_ref()
                        .and_then(|r| r.text.as_deref())
                        .is_some()
                    {
                        ctx.event
                            .metadata
                            .insert(SOURCE_KEY.to_string(), Value::String("payload".to_string()));
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "reply window build failed");
            }
        }

        match self.build_ambient_window(ctx) {
            Ok(window) if !window.is_empty() => {
                ctx.event
                    .metadata
                    .insert(AMBIENT_WINDOW_KEY.to_string(), Value::Array(window));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "ambient window build failed");
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message, ReplyRef};
    use crate::pipeline::{ArchiveStage, Pipeline};
    use std::sync::Arc;

    fn pipeline(archive: &InboundArchive) -> Pipeline {
        Pipeline::new(vec![
            Arc::new(ArchiveStage::new(archive.clone())),
            Arc::new(ReplyContextEnrich::new(archive.clone(), 6, 8, 1_000)),
        ])
    }

    struct Probe(tokio::sync::mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl Middleware for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        async fn handle(&self, ctx: &mut PipelineContext, _next: Next<'_>) -> Result<()> {
            let _ = self.0.send(ctx.event.clone());
            Ok(())
        }
    }

    fn group_msg(chat: &str, id: &str, text: &str) -> Message {
        let mut m = Message::text("whatsapp", chat, id, Identity::new("u1"), text);
        m.is_group = true;
        m
    }

    #[tokio::test]
    async fn ambient_window_is_oldest_first_for_groups() {
        let archive = InboundArchive::open_memory().unwrap();
        let p = pipeline(&archive);
        for i in 1..=3 {
            p.run(group_msg("g1@g.us", &format!("m{i}"), &format!("text {i}"))).await;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let probing = Pipeline::new(vec![
            Arc::new(ArchiveStage::new(archive.clone())),
            Arc::new(ReplyContextEnrich::new(archive.clone(), 6, 8, 1_000)),
            Arc::new(Probe(tx)),
        ]);
        probing.run(group_msg("g1@g.us", "m4", "latest")).await;

        let enriched = rx.recv().await.unwrap();
        let window = enriched.metadata.get(AMBIENT_WINDOW_KEY).unwrap();
        let texts: Vec<&str> = window
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["text 1", "text 2", "text 3"]);
    }

    #[tokio::test]
    async fn reply_window_walks_the_chain() {
        let archive = InboundArchive::open_memory().unwrap();
        let p = pipeline(&archive);

        p.run(group_msg("g1@g.us", "m1", "root")).await;
        let mut m2 = group_msg("g1@g.us", "m2", "middle");
        m2.reply_to = Some(ReplyRef {
            message_id: "m1".to_string(),
            text: None,
            sender: None,
        });
        p.run(m2).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let probing = Pipeline::new(vec![
            Arc::new(ArchiveStage::new(archive.clone())),
            Arc::new(ReplyContextEnrich::new(archive.clone(), 6, 8, 1_000)),
            Arc::new(Probe(tx)),
        ]);
        let mut m3 = group_msg("g1@g.us", "m3", "leaf");
        m3.reply_to = Some(ReplyRef {
            message_id: "m2".to_string(),
            text: None,
            sender: None,
        });
        probing.run(m3).await;

        let enriched = rx.recv().await.unwrap();
        let window = enriched.metadata.get(REPLY_WINDOW_KEY).unwrap();
        let texts: Vec<&str> = window
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["text"].as_str().unwrap())
            .collect();
        // Most-recent-first: the quoted message, then its ancestor.
        assert_eq!(texts, vec!["middle", "root"]);
    }

    #[tokio::test]
    async fn dm_gets_no_ambient_window() {
        let archive = InboundArchive::open_memory().unwrap();
        let p = pipeline(&archive);
        p.run(Message::text("whatsapp", "dm1", "m1", Identity::new("u1"), "one")).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let probing = Pipeline::new(vec![
            Arc::new(ArchiveStage::new(archive.clone())),
            Arc::new(ReplyContextEnrich::new(archive.clone(), 6, 8, 1_000)),
            Arc::new(Probe(tx)),
        ]);
        probing
            .run(Message::text("whatsapp", "dm1", "m2", Identity::new("u1"), "two"))
            .await;
        let enriched = rx.recv().await.unwrap();
        assert!(enriched.metadata.get(AMBIENT_WINDOW_KEY).is_none());
    }
}
