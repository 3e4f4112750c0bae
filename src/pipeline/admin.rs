//! Admin command stage
//!
//! Intercepts owner commands before policy evaluation: `/policy …`
//! (live policy management, DM-only), `/reset` (drop the chat's session
//! history), and `/panic` (graceful drain). Unauthorized or unknown
//! commands inside the namespace halt silently so nothing leaks to
//! strangers; other text passes through untouched.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::intents::OrchestratorIntent;
use crate::lifecycle::Shutdown;
use crate::policy::admin::{ActorSource, AdminActor, AdminService};
use crate::policy::PolicyEngine;
use crate::session::SessionStore;
use crate::Result;

/// Owner command interception
pub struct AdminCommand {
    engine: Arc<PolicyEngine>,
    service: Arc<AdminService>,
    sessions: SessionStore,
    shutdown: Arc<Shutdown>,
}

impl AdminCommand {
    /// Create the stage
    #[must_use]
    pub fn new(
        engine: Arc<PolicyEngine>,
        service: Arc<AdminService>,
        sessions: SessionStore,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            engine,
            service,
            sessions,
            shutdown,
        }
    }

    fn respond(&self, ctx: &mut PipelineContext, text: String) {
        ctx.intents.push(OrchestratorIntent::OutboundText {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            text,
            reply_to: None,
        });
    }
}

#[async_trait]
impl Middleware for AdminCommand {
    fn name(&self) -> &'static str {
        "admin_command"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let text = ctx.event.text_content();
        let trimmed = text.trim();

        let (command, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim().to_string()),
            None => (trimmed, String::new()),
        };

        if !matches!(command, "/policy" | "/reset" | "/panic") {
            return next.run(ctx).await;
        }

        let is_owner = self.engine.is_owner(&ctx.event.channel, &ctx.event.sender);
        if !is_owner {
            ctx.channel_metric("admin_unauthorized");
            ctx.halt();
            return Ok(());
        }

        match command {
            "/policy" => {
                // Policy management only in DMs; group members must not
                // even learn the command exists.
                if ctx.event.is_group {
                    ctx.channel_metric("admin_wrong_context");
                    ctx.halt();
                    return Ok(());
                }
                let actor = AdminActor {
                    source: ActorSource::Dm,
                    id: ctx.event.sender.id.clone(),
                    channel: ctx.event.channel.clone(),
                };
                let response = match self.service.handle(&actor, &rest) {
                    Ok(response) => response,
                    Err(e) => format!("error: {e}"),
                };
                self.respond(ctx, response);
                ctx.channel_metric("admin_command_handled");
            }
            "/reset" => {
                if let Err(e) = self.sessions.clear(&ctx.event.channel, &ctx.event.chat_id) {
                    self.respond(ctx, format!("error: {e}"));
                } else {
                    self.respond(ctx, "session history cleared".to_string());
                }
                ctx.channel_metric("admin_command_handled");
            }
            "/panic" => {
                self.shutdown.drain();
                self.respond(ctx, "draining: finishing in-flight work, then stopping".to_string());
                ctx.channel_metric("admin_panic");
            }
            _ => unreachable!(),
        }

        ctx.halt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message};
    use crate::pipeline::Pipeline;

    fn setup() -> (Pipeline, Arc<Shutdown>) {
        let dir = std::env::temp_dir().join(format!("attache-admin-mw-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let policy_path = dir.join("policy.json");
        std::fs::write(
            &policy_path,
            r#"{"version": 2, "owners": {"whatsapp": ["491701234567"]}}"#,
        )
        .unwrap();
        let engine = Arc::new(PolicyEngine::load(&policy_path).unwrap());
        let service = Arc::new(AdminService::new(
            Arc::clone(&engine),
            None,
            dir.join("backups"),
            dir.join("audit.jsonl"),
        ));
        let shutdown = Shutdown::new();
        let stage = AdminCommand::new(
            engine,
            service,
            SessionStore::new(dir.join("sessions")),
            Arc::clone(&shutdown),
        );
        (Pipeline::new(vec![Arc::new(stage)]), shutdown)
    }

    fn owner_dm(text: &str) -> Message {
        Message::text(
            "whatsapp",
            "491701234567@s.whatsapp.net",
            "m1",
            Identity::new("491701234567@s.whatsapp.net"),
            text,
        )
    }

    #[tokio::test]
    async fn owner_gets_policy_help() {
        let (pipeline, _) = setup();
        let intents = pipeline.run(owner_dm("/policy help")).await;
        let replies: Vec<&str> = intents
            .iter()
            .filter_map(|i| match i {
                OrchestratorIntent::OutboundText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("list-groups"));
    }

    #[tokio::test]
    async fn stranger_command_halts_silently() {
        let (pipeline, _) = setup();
        let msg = Message::text(
            "whatsapp",
            "stranger@s.whatsapp.net",
            "m1",
            Identity::new("stranger@s.whatsapp.net"),
            "/policy help",
        );
        let intents = pipeline.run(msg).await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
    }

    #[tokio::test]
    async fn policy_in_group_halts_silently() {
        let (pipeline, _) = setup();
        let mut msg = owner_dm("/policy help");
        msg.is_group = true;
        msg.chat_id = "g1@g.us".to_string();
        let intents = pipeline.run(msg).await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
    }

    #[tokio::test]
    async fn panic_requests_drain() {
        let (pipeline, shutdown) = setup();
        pipeline.run(owner_dm("/panic")).await;
        assert!(shutdown.is_draining());
    }

    #[tokio::test]
    async fn non_command_text_passes_through() {
        let (pipeline, _) = setup();
        let intents = pipeline.run(owner_dm("good morning")).await;
        assert!(intents.is_empty());
    }
}
