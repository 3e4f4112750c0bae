//! Access control stages
//!
//! `AccessControl` halts messages the policy rejected outright.
//! `NoReplyFilter` halts accepted messages that should not get a reply;
//! those stay archived and still feed background memory capture.

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::intents::{CaptureScope, OrchestratorIntent};
use crate::Result;

/// Halt for `accept_message == false`
pub struct AccessControl;

#[async_trait]
impl Middleware for AccessControl {
    fn name(&self) -> &'static str {
        "access_control"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let rejected = ctx
            .decision
            .as_ref()
            .is_some_and(|decision| !decision.accept_message);
        if rejected {
            let reason = ctx
                .decision
                .as_ref()
                .map(|d| d.reason.clone())
                .unwrap_or_default();
            ctx.metric(
                "policy_drop_access",
                vec![
                    ("channel".to_string(), ctx.event.channel.clone()),
                    ("reason".to_string(), reason),
                ],
            );
            ctx.halt();
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Halt for `should_respond == false`, queueing passive memory capture
pub struct NoReplyFilter;

#[async_trait]
impl Middleware for NoReplyFilter {
    fn name(&self) -> &'static str {
        "no_reply_filter"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let silent = ctx
            .decision
            .as_ref()
            .is_some_and(|decision| !decision.should_respond);
        if !silent {
            return next.run(ctx).await;
        }

        // Passive messages still feed the background capture lane.
        ctx.intents.push(OrchestratorIntent::MemoryCapture {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_id: Some(ctx.event.sender.id.clone()),
            message_id: Some(ctx.event.id.clone()),
            text: ctx.event.text_content(),
            kind: "turn".to_string(),
            scope: CaptureScope::Chat,
            assistant: false,
        });

        let reason = ctx
            .decision
            .as_ref()
            .map(|d| d.reason.clone())
            .unwrap_or_default();
        ctx.metric(
            "policy_drop_reply",
            vec![
                ("channel".to_string(), ctx.event.channel.clone()),
                ("reason".to_string(), reason),
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
    use crate::pipeline::{Pipeline, PolicyStage};
    use crate::policy::PolicyEngine;
    use std::sync::Arc;

    fn pipeline(policy_json: &str) -> Pipeline {
        let dir = std::env::temp_dir().join(format!("attache-access-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("policy.json"), policy_json).unwrap();
        let engine = Arc::new(PolicyEngine::load(dir.join("policy.json")).unwrap());
        Pipeline::new(vec![
            Arc::new(PolicyStage::new(engine)),
            Arc::new(AccessControl),
            Arc::new(NoReplyFilter),
        ])
    }

    #[tokio::test]
    async fn blocked_sender_is_dropped_without_output() {
        let pipeline = pipeline(
            r#"{"version": 2, "defaults": {"blockedSenders": {"senders": ["99"]}}}"#,
        );
        let intents = pipeline
            .run(Message::text("telegram", "c1", "m1", Identity::new("99"), "hi"))
            .await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
        assert!(intents.iter().any(|i| matches!(
            i,
            OrchestratorIntent::MetricEvent { name, .. } if name == "policy_drop_access"
        )));
        // Blocked senders do not even feed memory capture.
        assert!(!intents
            .iter()
            .any(|i| matches!(i, OrchestratorIntent::MemoryCapture { .. })));
    }

    #[tokio::test]
    async fn silent_message_still_feeds_memory() {
        let pipeline = pipeline(
            r#"{"version": 2, "defaults": {"whenToReply": {"mode": "off"}}}"#,
        );
        let intents = pipeline
            .run(Message::text("telegram", "c1", "m1", Identity::new("u1"), "note this"))
            .await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
        assert!(intents
            .iter()
            .any(|i| matches!(i, OrchestratorIntent::MemoryCapture { .. })));
    }
}
