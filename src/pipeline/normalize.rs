//! Normalize stage — whitespace and id canonicalization
//!
//! Strips whitespace from text blocks, canonicalizes channel/chat/
//! message ids, and drops messages whose content is empty after
//! stripping.

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::message::ContentKind;
use crate::Result;

/// Empty-content guard and id canonicalization
pub struct Normalize;

#[async_trait]
impl Middleware for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let event = &mut ctx.event;

        event.channel = event.channel.trim().to_lowercase();
        event.chat_id = event.chat_id.trim().to_string();
        event.id = event.id.trim().to_string();
        event.sender.id = event.sender.id.trim().to_string();

        for block in &mut event.content {
            if let Some(ref mut text) = block.text {
                let trimmed = text.trim();
                if trimmed.len() != text.len() {
                    *text = trimmed.to_string();
                }
            }
        }
        event
            .content
            .retain(|b| b.kind != ContentKind::Text || b.text.as_deref().is_some_and(|t| !t.is_empty()));

        if ctx.event.text_content().trim().is_empty() {
            ctx.channel_metric("event_drop_empty");
            ctx.halt();
            return Ok(());
        }

        next.run(ctx).await
    }
}
