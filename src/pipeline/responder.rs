//! Responder stage — invoke the reply generator
//!
//! Emits `Typing{on}` before and `Typing{off}` after the call, recalls
//! relevant memories, and enforces the per-call timeout. Failures
//! produce a short apology and a failure reaction; repeated failures
//! for the same chat suppress output for a cooldown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::intents::{OrchestratorIntent, TypingState};
use crate::memory::{MemoryService, RecalledEntry};
use crate::responder::{FailureTracker, Responder};
use crate::{Error, Result};

/// Short apology sent when the responder call fails
const APOLOGY: &str = "sorry, I hit a temporary error — try again in a bit";

/// Reply generation
pub struct ResponderStage {
    responder: Arc<dyn Responder>,
    memory: Option<Arc<MemoryService>>,
    failures: Arc<FailureTracker>,
    timeout: Duration,
    recall_limit: usize,
}

impl ResponderStage {
    /// Create the stage
    #[must_use]
    pub fn new(
        responder: Arc<dyn Responder>,
        memory: Option<Arc<MemoryService>>,
        failures: Arc<FailureTracker>,
        timeout: Duration,
        recall_limit: usize,
    ) -> Self {
        Self {
            responder,
            memory,
            failures,
            timeout,
            recall_limit,
        }
    }

    async fn recall(&self, ctx: &PipelineContext) -> Vec<RecalledEntry> {
        let Some(ref memory) = self.memory else {
            return Vec::new();
        };
        memory
            .recall(
                &ctx.event.text_content(),
                &ctx.event.channel,
                &ctx.event.chat_id,
                &ctx.event.sender.id,
                self.recall_limit,
            )
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, "memory recall failed, degrading to no context");
                Vec::new()
            })
    }

    fn typing(ctx: &mut PipelineContext, state: TypingState) {
        ctx.intents.push(OrchestratorIntent::Typing {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            state,
        });
    }

    fn fail(&self, ctx: &mut PipelineContext, error: &Error) {
        let chat_key = format!("{}:{}", ctx.event.channel, ctx.event.chat_id);
        tracing::warn!(chat = %chat_key, error = %error, "responder call failed");
        ctx.metric(
            "responder_failed",
            vec![("channel".to_string(), ctx.event.channel.clone())],
        );

        let entered_suppression = self.failures.record_failure(&chat_key);
        if entered_suppression {
            tracing::warn!(chat = %chat_key, "responder failures escalated, suppressing chat");
        }

        if !ctx.event.id.is_empty() {
            ctx.intents.push(OrchestratorIntent::Reaction {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                message_id: ctx.event.id.clone(),
                emoji: "⚠️".to_string(),
                participant: ctx.event.participant.clone(),
            });
        }
        ctx.intents.push(OrchestratorIntent::OutboundText {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            text: APOLOGY.to_string(),
            reply_to: None,
        });
        ctx.halt();
    }
}

#[async_trait]
impl Middleware for ResponderStage {
    fn name(&self) -> &'static str {
        "responder"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let Some(decision) = ctx.decision.clone() else {
            return Err(Error::pipeline("responder", "no policy decision present"));
        };

        let chat_key = format!("{}:{}", ctx.event.channel, ctx.event.chat_id);
        if self.failures.is_suppressed(&chat_key) {
            ctx.channel_metric("responder_suppressed");
            ctx.halt();
            return Ok(());
        }

        let hits = self.recall(ctx).await;
        let memory_context = MemoryService::format_for_prompt(&hits);

        Self::typing(ctx, TypingState::On);
        let call = self
            .responder
            .generate_reply(&ctx.event, &decision, &memory_context);
        let outcome = tokio::time::timeout(self.timeout, call).await;
        Self::typing(ctx, TypingState::Off);

        match outcome {
            Ok(Ok(reply)) => {
                self.failures.record_success(&chat_key);
                ctx.reply = reply;
            }
            Ok(Err(e)) => {
                self.fail(ctx, &e);
                return Ok(());
            }
            Err(_) => {
                self.fail(
                    ctx,
                    &Error::Responder(format!("timed out after {:?}", self.timeout)),
                );
                return Ok(());
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponderConfig;
    use crate::message::{Identity, Message};
    use crate::pipeline::{Pipeline, PolicyStage};
    use crate::policy::PolicyEngine;

    struct Canned(Option<String>);

    #[async_trait]
    impl Responder for Canned {
        async fn generate_reply(
            &self,
            _event: &Message,
            _decision: &crate::policy::PolicyDecision,
            _memory: &str,
        ) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    struct Exploding;

    #[async_trait]
    impl Responder for Exploding {
        async fn generate_reply(
            &self,
            _event: &Message,
            _decision: &crate::policy::PolicyDecision,
            _memory: &str,
        ) -> Result<Option<String>> {
            Err(Error::Responder("provider unavailable".to_string()))
        }
    }

    fn pipeline(responder: Arc<dyn Responder>) -> Pipeline {
        let dir = std::env::temp_dir().join(format!("attache-resp-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("policy.json"), r#"{"version": 2}"#).unwrap();
        let engine = Arc::new(PolicyEngine::load(dir.join("policy.json")).unwrap());
        let failures = Arc::new(FailureTracker::new(&ResponderConfig::default()));
        Pipeline::new(vec![
            Arc::new(PolicyStage::new(engine)),
            Arc::new(ResponderStage::new(
                responder,
                None,
                failures,
                Duration::from_secs(5),
                6,
            )),
        ])
    }

    fn msg() -> Message {
        Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "hello")
    }

    #[tokio::test]
    async fn typing_wraps_the_call() {
        let intents = pipeline(Arc::new(Canned(Some("hey".to_string())))).run(msg()).await;
        let typing: Vec<TypingState> = intents
            .iter()
            .filter_map(|i| match i {
                OrchestratorIntent::Typing { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(typing, vec![TypingState::On, TypingState::Off]);
    }

    #[tokio::test]
    async fn failure_apologizes_and_reacts() {
        let intents = pipeline(Arc::new(Exploding)).run(msg()).await;
        assert!(intents.iter().any(|i| matches!(
            i,
            OrchestratorIntent::OutboundText { text, .. } if text.contains("temporary error")
        )));
        assert!(intents
            .iter()
            .any(|i| matches!(i, OrchestratorIntent::Reaction { .. })));
    }

    #[tokio::test]
    async fn repeated_failures_suppress_the_chat() {
        let p = pipeline(Arc::new(Exploding));
        for _ in 0..3 {
            p.run(msg()).await;
        }
        // Fourth run: suppressed, no apology.
        let intents = p.run(msg()).await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
        assert!(intents.iter().any(|i| matches!(
            i,
            OrchestratorIntent::MetricEvent { name, .. } if name == "responder_suppressed"
        )));
    }
}
