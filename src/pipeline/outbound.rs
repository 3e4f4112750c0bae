//! Outbound assembly stage
//!
//! Turns the responder's reply into final intents: reaction-marker
//! handling, output security, voice synthesis per the chat's voice
//! policy (with text fallback), threading in mention-only groups,
//! session persistence, and memory-capture queueing.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Middleware, Next, PipelineContext};
use crate::cache::DedupCache;
use crate::intents::{CaptureScope, OrchestratorIntent};
use crate::media::tts::{strip_markdown_for_tts, truncate_for_voice, TtsSynthesizer};
use crate::media::MediaStorage;
use crate::policy::{PolicyEngine, WhenToReplyMode};
use crate::security::SecurityEngine;
use crate::session::SessionStore;
use crate::Result;

static REACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*::reaction::(.+?)\s*$").unwrap());
static REACTION_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(.+?)\n+::reaction::[^\n]+\s*$").unwrap());

/// Owner diagnostic alert cooldown
const ALERT_COOLDOWN: Duration = Duration::from_secs(300);

/// Final intent assembly
pub struct Outbound {
    security: Arc<SecurityEngine>,
    engine: Arc<PolicyEngine>,
    sessions: SessionStore,
    tts: Option<Arc<dyn TtsSynthesizer>>,
    media: Option<MediaStorage>,
    max_audio_bytes: usize,
    capture_assistant: bool,
    block_message: String,
    alert_cooldown: Mutex<DedupCache<String>>,
}

impl Outbound {
    /// Create the stage
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        security: Arc<SecurityEngine>,
        engine: Arc<PolicyEngine>,
        sessions: SessionStore,
        tts: Option<Arc<dyn TtsSynthesizer>>,
        media: Option<MediaStorage>,
        max_audio_bytes: usize,
        capture_assistant: bool,
        block_message: impl Into<String>,
    ) -> Self {
        Self {
            security,
            engine,
            sessions,
            tts,
            media,
            max_audio_bytes,
            capture_assistant,
            block_message: block_message.into(),
            alert_cooldown: Mutex::new(DedupCache::new(ALERT_COOLDOWN, 256)),
        }
    }

    fn queue_capture(&self, ctx: &mut PipelineContext, text: String, assistant: bool) {
        ctx.intents.push(OrchestratorIntent::MemoryCapture {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_id: Some(ctx.event.sender.id.clone()),
            message_id: (!assistant).then(|| ctx.event.id.clone()),
            text,
            kind: "turn".to_string(),
            scope: CaptureScope::Chat,
            assistant,
        });
    }

    fn owner_alert(&self, ctx: &mut PipelineContext, reason: &str) {
        let key = format!("{}:{reason}", ctx.event.channel);
        let recently_alerted = self
            .alert_cooldown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check_and_insert(key);
        if recently_alerted {
            return;
        }

        let owners = self
            .engine
            .snapshot()
            .owners
            .get(&ctx.event.channel)
            .cloned()
            .unwrap_or_default();
        let text = format!(
            "⚠️ voice fallback in {}:{}\nreason={reason}",
            ctx.event.channel, ctx.event.chat_id
        );
        for owner in owners {
            let target = if ctx.event.channel == "whatsapp" && !owner.contains('@') {
                let digits: String = owner.chars().filter(char::is_ascii_digit).collect();
                if digits.is_empty() {
                    continue;
                }
                format!("{digits}@s.whatsapp.net")
            } else {
                owner
            };
            ctx.intents.push(OrchestratorIntent::OutboundText {
                channel: ctx.event.channel.clone(),
                chat_id: target,
                text: text.clone(),
                reply_to: None,
            });
        }
    }

    /// Synthesize a voice reply; `None` means fall back to text
    async fn maybe_voice(&self, ctx: &mut PipelineContext, reply: &str) -> Option<(String, String)> {
        let decision = ctx.decision.as_ref()?;
        let mode = decision.voice.mode;
        if !mode.speaks() {
            return None;
        }
        if mode == crate::policy::VoiceOutputMode::InKind && !ctx.event.is_voice() {
            return None;
        }
        let tts = self.tts.as_ref()?;
        let media = self.media.as_ref()?;

        let plain = strip_markdown_for_tts(reply);
        let limited = truncate_for_voice(
            &plain,
            decision.voice.max_sentences,
            decision.voice.max_chars,
        );
        if limited.is_empty() {
            return None;
        }

        let audio = match tts.synthesize(&limited, &decision.voice.voice).await {
            Ok(audio) => audio,
            Err(e) => {
                self.owner_alert(ctx, &format!("tts_error:{e}"));
                return None;
            }
        };
        if audio.is_empty() {
            self.owner_alert(ctx, "tts_empty_audio");
            return None;
        }
        if audio.len() > self.max_audio_bytes {
            self.owner_alert(
                ctx,
                &format!("tts_audio_too_large:{}>{}", audio.len(), self.max_audio_bytes),
            );
            return None;
        }

        let file_name = format!("tts-{}.ogg", uuid::Uuid::new_v4().simple());
        match media.persist_outgoing_tts(&file_name, &audio) {
            Ok(path) => Some((path.display().to_string(), "audio/ogg".to_string())),
            Err(e) => {
                self.owner_alert(ctx, &format!("tts_write_failed:{e}"));
                None
            }
        }
    }
}

#[async_trait]
impl Middleware for Outbound {
    fn name(&self) -> &'static str {
        "outbound"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        // User messages that made it this far are always
        // capture-eligible; filters run in the background lane.
        let user_text = ctx.event.text_content();
        self.queue_capture(ctx, user_text.clone(), false);

        let Some(mut reply) = ctx.reply.clone() else {
            return next.run(ctx).await;
        };

        // Reaction-only replies: "::reaction::👍" or with a text body on
        // the following lines.
        let reaction_full = REACTION_RE
            .captures(&reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        if let Some(full) = reaction_full {
            if !ctx.event.id.is_empty() {
                let (emoji, body) = full
                    .split_once('\n')
                    .map_or((full.as_str(), ""), |(e, b)| (e.trim(), b.trim()));
                ctx.intents.push(OrchestratorIntent::Reaction {
                    channel: ctx.event.channel.clone(),
                    chat_id: ctx.event.chat_id.clone(),
                    message_id: ctx.event.id.clone(),
                    emoji: emoji.to_string(),
                    participant: ctx.event.participant.clone(),
                });
                ctx.channel_metric("reaction_sent");
                if body.is_empty() {
                    if let Err(e) = self.sessions.append_turn(
                        &ctx.event.channel,
                        &ctx.event.chat_id,
                        &user_text,
                        &format!("[reacted with {emoji}]"),
                    ) {
                        tracing::debug!(error = %e, "session persist failed");
                    }
                    return next.run(ctx).await;
                }
                reply = body.to_string();
            }
        } else if let Some(body) = REACTION_SUFFIX_RE
            .captures(&reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
        {
            // The model appended a reaction marker after text; keep the
            // clean body only.
            reply = body;
        }

        // Output security.
        let checked = self.security.check_output(&reply);
        if checked.blocked {
            ctx.metric(
                "security_output_blocked",
                vec![
                    ("channel".to_string(), ctx.event.channel.clone()),
                    (
                        "rule".to_string(),
                        checked.blocked_by.unwrap_or("unknown").to_string(),
                    ),
                ],
            );
            reply = self.block_message.clone();
        } else if let Some(sanitized) = checked.sanitized {
            ctx.channel_metric("security_output_sanitized");
            reply = sanitized;
        }

        // Threading: in mention-only groups the reply quotes the
        // triggering message so the thread stays readable.
        let should_thread = ctx.event.is_group
            && !ctx.event.id.is_empty()
            && ctx
                .decision
                .as_ref()
                .is_some_and(|d| d.when_to_reply_mode == WhenToReplyMode::MentionOnly)
            && (ctx.event.mentioned_bot || ctx.event.reply_to_bot);
        let reply_to = should_thread.then(|| ctx.event.id.clone());

        // Voice or text.
        if let Some((path, mime)) = self.maybe_voice(ctx, &reply).await {
            ctx.intents.push(OrchestratorIntent::OutboundMedia {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                path,
                mime_type: Some(mime),
                caption: None,
                reply_to: Some(ctx.event.id.clone()).filter(|id| !id.is_empty()),
            });
            ctx.channel_metric("voice_reply_sent");
        } else {
            ctx.intents.push(OrchestratorIntent::OutboundText {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                text: reply.clone(),
                reply_to,
            });
            ctx.channel_metric("response_sent");
        }

        if let Err(e) =
            self.sessions
                .append_turn(&ctx.event.channel, &ctx.event.chat_id, &user_text, &reply)
        {
            tracing::debug!(error = %e, "session persist failed");
        }

        if self.capture_assistant {
            self.queue_capture(ctx, reply, true);
        }

        next.run(ctx).await
    }
}
