//! New-chat notification stage
//!
//! When a `(channel, chat_id)` pair is seen for the first time, the
//! configured owners get a DM describing the chat with the quick policy
//! commands to approve or block it. The seen-set is primed from the
//! archive at construction so restarts do not re-notify. Never halts.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::archive::InboundArchive;
use crate::intents::OrchestratorIntent;
use crate::policy::PolicyEngine;
use crate::Result;

/// First-contact owner notification
pub struct NewChatNotify {
    engine: Arc<PolicyEngine>,
    seen: Mutex<HashSet<String>>,
}

impl NewChatNotify {
    /// Create the stage, priming the seen-set from the archive's
    /// distinct chat sets
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>, archive: &InboundArchive, channels: &[&str]) -> Self {
        let mut seen = HashSet::new();
        for channel in channels {
            if let Ok(chats) = archive.distinct_chats(channel, None) {
                for chat in chats {
                    seen.insert(format!("{channel}:{chat}"));
                }
            }
        }
        Self {
            engine,
            seen: Mutex::new(seen),
        }
    }

    fn notification(event: &crate::message::Message) -> String {
        let chat_type = if event.is_group { "group" } else { "chat" };
        format!(
            "🔔 New {chat_type} on {channel}\n🆔 {chat}\n\n⚡ Quick commands:\n  /policy allow-group {chat}\n  /policy set-when {chat} mention_only\n  /policy block-group {chat}",
            channel = event.channel,
            chat = event.chat_id,
        )
    }

    fn owner_dm_target(channel: &str, owner: &str) -> Option<String> {
        let value = owner.trim();
        if value.is_empty() {
            return None;
        }
        if channel != "whatsapp" || value.contains('@') {
            return Some(value.to_string());
        }
        let digits: String = value.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            None
        } else {
            Some(format!("{digits}@s.whatsapp.net"))
        }
    }
}

#[async_trait]
impl Middleware for NewChatNotify {
    fn name(&self) -> &'static str {
        "new_chat_notify"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let key = format!("{}:{}", ctx.event.channel, ctx.event.chat_id);
        let first_seen = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key);

        if first_seen {
            let owners = self.engine.snapshot().owners.get(&ctx.event.channel).cloned();
            if let Some(owners) = owners {
                let message = Self::notification(&ctx.event);
                let mut targets: Vec<String> = owners
                    .iter()
                    .filter_map(|o| Self::owner_dm_target(&ctx.event.channel, o))
                    .collect();
                targets.sort();
                targets.dedup();
                for target in targets {
                    ctx.intents.push(OrchestratorIntent::OutboundText {
                        channel: ctx.event.channel.clone(),
                        chat_id: target,
                        text: message.clone(),
                        reply_to: None,
                    });
                }
                if !owners.is_empty() {
                    ctx.channel_metric("new_chat_notified");
                }
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message};
    use crate::pipeline::Pipeline;

    fn engine(owners: &str) -> Arc<PolicyEngine> {
        let dir = std::env::temp_dir().join(format!("attache-newchat-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("policy.json"),
            format!(r#"{{"version": 2, "owners": {owners}}}"#),
        )
        .unwrap();
        Arc::new(PolicyEngine::load(dir.join("policy.json")).unwrap())
    }

    fn group(chat: &str, id: &str) -> Message {
        let mut m = Message::text("whatsapp", chat, id, Identity::new("u1"), "hello");
        m.is_group = true;
        m
    }

    #[tokio::test]
    async fn first_contact_notifies_owner_dm_once() {
        let archive = InboundArchive::open_memory().unwrap();
        let engine = engine(r#"{"whatsapp": ["+491701234567"]}"#);
        let stage = NewChatNotify::new(engine, &archive, &["whatsapp"]);
        let pipeline = Pipeline::new(vec![Arc::new(stage)]);

        let first = pipeline.run(group("g1@g.us", "m1")).await;
        let notify: Vec<_> = first
            .iter()
            .filter_map(|i| match i {
                OrchestratorIntent::OutboundText { chat_id, text, .. } => Some((chat_id, text)),
                _ => None,
            })
            .collect();
        assert_eq!(notify.len(), 1);
        assert_eq!(notify[0].0, "491701234567@s.whatsapp.net");
        assert!(notify[0].1.contains("g1@g.us"));

        let second = pipeline.run(group("g1@g.us", "m2")).await;
        assert!(second.iter().all(|i| !i.is_outbound()));
    }

    #[tokio::test]
    async fn known_chats_from_archive_do_not_notify() {
        let archive = InboundArchive::open_memory().unwrap();
        archive.insert(&group("g1@g.us", "m0")).unwrap();
        let engine = engine(r#"{"whatsapp": ["+491701234567"]}"#);
        let stage = NewChatNotify::new(engine, &archive, &["whatsapp"]);
        let pipeline = Pipeline::new(vec![Arc::new(stage)]);

        let intents = pipeline.run(group("g1@g.us", "m1")).await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
    }

    #[tokio::test]
    async fn no_owners_means_no_notification() {
        let archive = InboundArchive::open_memory().unwrap();
        let engine = engine("{}");
        let stage = NewChatNotify::new(engine, &archive, &["whatsapp"]);
        let pipeline = Pipeline::new(vec![Arc::new(stage)]);
        let intents = pipeline.run(group("g1@g.us", "m1")).await;
        assert!(intents.iter().all(|i| !i.is_outbound()));
    }
}
