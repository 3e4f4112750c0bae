//! Policy stage — evaluate and record the decision
//!
//! Calls the policy engine and stores the result in `ctx.decision`.
//! Never halts; downstream stages act on the decision.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::policy::{PolicyEngine, PolicyQuery};
use crate::Result;

/// Decision provider for the rest of the chain
pub struct PolicyStage {
    engine: Arc<PolicyEngine>,
}

impl PolicyStage {
    /// Create the stage
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Middleware for PolicyStage {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let transcript = ctx.event.transcript().map(ToString::to_string);
        let decision = self.engine.evaluate(&PolicyQuery {
            channel: &ctx.event.channel,
            chat_id: &ctx.event.chat_id,
            sender: &ctx.event.sender,
            is_group: ctx.event.is_group,
            mentioned_bot: ctx.event.mentioned_bot,
            reply_to_bot: ctx.event.reply_to_bot,
            voice_transcript: transcript.as_deref(),
        });
        ctx.decision = Some(decision);
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message};
    use crate::pipeline::Pipeline;

    #[tokio::test]
    async fn decision_is_recorded() {
        struct Probe;

        #[async_trait]
        impl Middleware for Probe {
            fn name(&self) -> &'static str {
                "probe"
            }

            async fn handle(&self, ctx: &mut PipelineContext, _next: Next<'_>) -> Result<()> {
                assert!(ctx.decision.as_ref().is_some_and(|d| d.accept_message));
                Ok(())
            }
        }

        let dir = std::env::temp_dir().join(format!("attache-polstage-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("policy.json"), r#"{"version": 2}"#).unwrap();
        let engine = Arc::new(PolicyEngine::load(dir.join("policy.json")).unwrap());

        let pipeline = Pipeline::new(vec![Arc::new(PolicyStage::new(engine)), Arc::new(Probe)]);
        pipeline
            .run(Message::text("telegram", "c1", "m1", Identity::new("u1"), "hi"))
            .await;
    }
}
