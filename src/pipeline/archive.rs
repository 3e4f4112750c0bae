//! Archive stage — persist inbound messages
//!
//! Inserts the message (and, when present, its quoted reply text) into
//! the inbound archive. Best-effort: a write failure is logged and
//! counted but never halts the pipeline, since the archive only feeds
//! read-side context features.

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::archive::InboundArchive;
use crate::Result;

/// Idempotent archive insert
pub struct ArchiveStage {
    archive: InboundArchive,
}

impl ArchiveStage {
    /// Create the stage
    #[must_use]
    pub fn new(archive: InboundArchive) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl Middleware for ArchiveStage {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        if let Err(e) = self.archive.insert(&ctx.event) {
            tracing::warn!(error = %e, "archive insert failed");
            ctx.channel_metric("archive_write_failed");
        }

        // Seed the quoted message so later reply walks can resolve it
        // even if the original was never delivered to us.
        if let Some(reply) = ctx.event.reply_to.clone() {
            if let Some(ref text) = reply.text {
                if let Err(e) = self.archive.seed_quoted(
                    &ctx.event.channel,
                    &ctx.event.chat_id,
                    &reply.message_id,
                    reply.sender.as_deref(),
                    text,
                ) {
                    tracing::debug!(error = %e, "quoted message seed failed");
                }
            }
        }

        next.run(ctx).await
    }
}
