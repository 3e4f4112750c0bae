//! WhatsApp channel adapter
//!
//! Speaks bridge protocol v2 over a loopback WebSocket: verifies the
//! bridge's protocol version on connect, correlates command responses
//! by `requestId`, converts inbound `message` events into canonical
//! [`Message`]s (with optional voice-note transcription), and coalesces
//! rapid-fire messages from the same sender into one inbound event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::Channel;
use crate::bridge::protocol::{Command, CommandKind, Event, PROTOCOL_VERSION};
use crate::bridge::session::backoff_delay;
use crate::bus::InboundBus;
use crate::media::asr::AsrTranscriber;
use crate::message::{ContentBlock, ContentKind, Identity, Message, ReplyRef};
use crate::{Error, Result};

/// Command response timeout
const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

static BOLD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static UNDERLINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__(.+?)__").unwrap());
static STRIKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[-*]\s+").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());

/// Convert common markdown to WhatsApp's formatting dialect
#[must_use]
pub fn markdown_to_whatsapp(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Shield code spans from formatting rewrites.
    let mut code_blocks = Vec::new();
    let code_re = Regex::new(r"```[\w]*\n?([\s\S]*?)```").unwrap();
    let text = code_re
        .replace_all(text, |caps: &regex::Captures<'_>| {
            code_blocks.push(caps[1].to_string());
            format!("\u{0}CB{}\u{0}", code_blocks.len() - 1)
        })
        .into_owned();

    let text = BOLD_RE.replace_all(&text, "*$1*");
    let text = UNDERLINE_RE.replace_all(&text, "_$1_");
    let text = STRIKE_RE.replace_all(&text, "~$1~");
    let text = HEADING_RE.replace_all(&text, "");
    let text = BULLET_RE.replace_all(&text, "• ");
    let mut out = LINK_RE.replace_all(&text, "$1 ($2)").into_owned();

    for (i, code) in code_blocks.iter().enumerate() {
        out = out.replace(
            &format!("\u{0}CB{i}\u{0}"),
            &format!("```\n{code}\n```"),
        );
    }
    out.trim().to_string()
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Value>>>;

struct DebounceState {
    generation: u64,
    buffer: Vec<Message>,
}

/// WhatsApp adapter backed by the loopback bridge
pub struct WhatsAppChannel {
    bridge_url: String,
    token: String,
    debounce_ms: u64,
    inbound: InboundBus,
    asr: Option<Arc<dyn AsrTranscriber>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    pending: Arc<PendingMap>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    request_counter: AtomicU64,
    debounce: Arc<Mutex<HashMap<String, DebounceState>>>,
    self_ref: Mutex<Option<std::sync::Weak<Self>>>,
}

impl WhatsAppChannel {
    /// Create the adapter
    #[must_use]
    pub fn new(
        bridge_url: String,
        token: String,
        debounce_ms: u64,
        inbound: InboundBus,
        asr: Option<Arc<dyn AsrTranscriber>>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            bridge_url,
            token,
            debounce_ms,
            inbound,
            asr,
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            writer: Mutex::new(None),
            request_counter: AtomicU64::new(0),
            debounce: Arc::new(Mutex::new(HashMap::new())),
            self_ref: Mutex::new(None),
        });
        *channel
            .self_ref
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::downgrade(&channel));
        channel
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("req-{n}-{}", uuid::Uuid::new_v4().simple())
    }

    /// Issue one command and await its correlated response
    async fn send_command(&self, kind: CommandKind) -> Result<Value> {
        let request_id = self.next_request_id();
        let command = Command {
            request_id: Some(request_id.clone()),
            account_id: None,
            kind,
        };
        let frame = command.to_wire(&self.token).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id.clone(), tx);

        {
            let writer = self
                .writer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(writer) = writer.as_ref() else {
                return Err(Error::Channel("whatsapp bridge not connected".to_string()));
            };
            writer
                .send(frame)
                .map_err(|_| Error::Channel("bridge writer closed".to_string()))?;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(payload)) => {
                if payload.get("code").is_some() && payload.get("retryable").is_some() {
                    return Err(Error::Bridge(format!(
                        "bridge error {}: {}",
                        payload["code"].as_str().unwrap_or("?"),
                        payload["message"].as_str().unwrap_or("")
                    )));
                }
                Ok(payload)
            }
            Ok(Err(_)) => Err(Error::Channel("bridge response channel dropped".to_string())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&request_id);
                Err(Error::Channel("bridge command timed out".to_string()))
            }
        }
    }

    async fn run_connection(this: &Arc<Self>) -> Result<()> {
        let (stream, _) = connect_async(&this.bridge_url)
            .await
            .map_err(|e| Error::Channel(format!("bridge connect failed: {e}")))?;
        let (mut sink, mut stream) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        *this
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(writer_tx);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        // Deterministic startup: a health round-trip that must agree on
        // the protocol version.
        let health_check = {
            let this = Arc::clone(this);
            tokio::spawn(async move {
                let health = this.send_command(CommandKind::Health).await?;
                let version = health
                    .get("protocolVersion")
                    .or_else(|| health.get("version"))
                    .and_then(Value::as_u64);
                if version != Some(u64::from(PROTOCOL_VERSION)) {
                    return Err(Error::Channel(format!(
                        "bridge protocol mismatch: expected v{PROTOCOL_VERSION}, got {version:?}"
                    )));
                }
                this.connected.store(true, Ordering::SeqCst);
                tracing::info!("connected to WhatsApp bridge (protocol v2)");
                Ok(())
            })
        };

        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| Error::Channel(format!("bridge read error: {e}")))?;
            let WsMessage::Text(text) = frame else {
                if matches!(frame, WsMessage::Close(_)) {
                    break;
                }
                continue;
            };
            Self::handle_bridge_frame(this, &text).await;
        }

        health_check.abort();
        writer_task.abort();
        this.connected.store(false, Ordering::SeqCst);
        *this
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        Ok(())
    }

    async fn handle_bridge_frame(this: &Arc<Self>, raw: &str) {
        let Ok(event) = serde_json::from_str::<Event>(raw) else {
            tracing::warn!("invalid frame from bridge");
            return;
        };
        if event.version != PROTOCOL_VERSION {
            tracing::warn!(version = event.version, "unexpected bridge protocol version");
            return;
        }

        match event.kind.as_str() {
            "response" | "error" if event.request_id.is_some() => {
                let request_id = event.request_id.unwrap_or_default();
                let waiter = this
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&request_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(event.payload);
                }
            }
            "message" => {
                if let Some(message) = this.parse_inbound(&event.payload).await {
                    Self::ingest(this, message);
                }
            }
            "status" => {
                tracing::info!(status = %event.payload["status"], "whatsapp status");
            }
            "qr" => {
                tracing::info!("whatsapp login QR issued; run the login flow to pair");
            }
            "error" => {
                tracing::warn!(error = %event.payload, "whatsapp bridge error");
            }
            _ => {}
        }
    }

    async fn parse_inbound(&self, payload: &Value) -> Option<Message> {
        let message_id = payload.get("messageId")?.as_str()?.to_string();
        let chat_jid = payload.get("chatJid")?.as_str()?.to_string();
        let sender_id = payload.get("senderId")?.as_str()?.to_string();
        let text = payload.get("text").and_then(Value::as_str).unwrap_or("");
        if message_id.is_empty() || chat_jid.is_empty() || sender_id.is_empty() {
            return None;
        }

        let mut content = Vec::new();
        let media = payload.get("media");
        match media.and_then(|m| m.get("kind")).and_then(Value::as_str) {
            Some(kind) => {
                let block_kind = match kind {
                    "image" => ContentKind::Image,
                    "audio" => ContentKind::Audio,
                    "video" => ContentKind::Video,
                    "sticker" => ContentKind::Sticker,
                    _ => ContentKind::File,
                };
                let mut block = ContentBlock::media(
                    block_kind,
                    media
                        .and_then(|m| m.get("path"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    media
                        .and_then(|m| m.get("mimeType"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                );
                block.size_bytes = media.and_then(|m| m.get("bytes")).and_then(Value::as_u64);
                if !text.is_empty() && !text.starts_with('[') {
                    block.text = Some(text.to_string());
                }

                // Voice notes get a transcript before policy runs so
                // wake phrases can match.
                if block_kind == ContentKind::Audio {
                    if let (Some(asr), Some(path)) = (self.asr.as_ref(), block.path.clone()) {
                        if let Ok(audio) = std::fs::read(&path) {
                            match asr.transcribe(audio, "voice.ogg").await {
                                Ok(transcript) => block.transcript = Some(transcript),
                                Err(e) => {
                                    tracing::debug!(error = %e, "voice transcription failed");
                                }
                            }
                        }
                    }
                }
                content.push(block);
            }
            None => content.push(ContentBlock::text(text)),
        }

        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let reply_to = payload
            .get("replyToMessageId")
            .and_then(Value::as_str)
            .map(|id| ReplyRef {
                message_id: id.to_string(),
                text: payload
                    .get("replyToText")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                sender: payload
                    .get("replyToParticipantJid")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            });

        Some(Message {
            id: message_id,
            channel: "whatsapp".to_string(),
            chat_id: chat_jid,
            sender: Identity::new(sender_id),
            content,
            reply_to,
            timestamp,
            is_group: payload
                .get("isGroup")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            mentioned_bot: payload
                .get("mentionedBot")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reply_to_bot: payload
                .get("replyToBot")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            participant: payload
                .get("participantJid")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            metadata: serde_json::Map::new(),
        })
    }

    /// Publish a message, coalescing rapid text messages from the same
    /// `(chat, sender)` pair. Commands and media bypass the debounce.
    fn ingest(this: &Arc<Self>, message: Message) {
        let is_command = message.text_content().trim_start().starts_with('/');
        let has_media = message.content.iter().any(|b| b.kind != ContentKind::Text);
        if this.debounce_ms == 0 || is_command || has_media {
            this.inbound.publish(message);
            return;
        }

        let key = format!("{}:{}", message.chat_id, message.sender.id);
        let generation = {
            let mut buffers = this
                .debounce
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = buffers.entry(key.clone()).or_insert(DebounceState {
                generation: 0,
                buffer: Vec::new(),
            });
            state.generation += 1;
            state.buffer.push(message);
            state.generation
        };

        let this = Arc::clone(this);
        let window = Duration::from_millis(this.debounce_ms);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let merged = {
                let mut buffers = this
                    .debounce
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match buffers.get_mut(&key) {
                    // A newer message restarted the window; its task
                    // will flush.
                    Some(state) if state.generation != generation => None,
                    Some(state) => {
                        let batch = std::mem::take(&mut state.buffer);
                        buffers.remove(&key);
                        merge_batch(batch)
                    }
                    None => None,
                }
            };
            if let Some(merged) = merged {
                this.inbound.publish(merged);
            }
        });
    }
}

/// Merge a debounce batch into one message whose text is the
/// concatenation
fn merge_batch(batch: Vec<Message>) -> Option<Message> {
    let mut iter = batch.into_iter();
    let first = iter.next()?;
    let mut texts = vec![first.text_content()];
    let mut last = first;
    for message in iter {
        texts.push(message.text_content());
        last = message;
    }
    if texts.len() > 1 {
        last.content = vec![ContentBlock::text(
            texts
                .iter()
                .filter(|t| !t.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"),
        )];
    }
    Some(last)
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn connect(&self) -> Result<()> {
        let this = self
            .self_ref
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
            .ok_or_else(|| Error::Channel("whatsapp adapter handle lost".to_string()))?;
        this.spawn();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, chat_id: &str, text: &str, reply_to: Option<&str>) -> Result<()> {
        self.send_command(CommandKind::SendText(
            crate::bridge::protocol::SendTextPayload {
                to: chat_id.to_string(),
                text: markdown_to_whatsapp(text),
                reply_to_message_id: reply_to.map(ToString::to_string),
            },
        ))
        .await?;
        Ok(())
    }

    async fn send_media(
        &self,
        chat_id: &str,
        path: &str,
        mime_type: Option<&str>,
        caption: Option<&str>,
        reply_to: Option<&str>,
    ) -> Result<()> {
        self.send_command(CommandKind::SendMedia(
            crate::bridge::protocol::SendMediaPayload {
                to: chat_id.to_string(),
                media_path: Some(path.to_string()),
                mime_type: mime_type.map(ToString::to_string),
                caption: caption.map(ToString::to_string),
                reply_to_message_id: reply_to.map(ToString::to_string),
                ..Default::default()
            },
        ))
        .await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str, on: bool) -> Result<()> {
        self.send_command(CommandKind::PresenceUpdate(
            crate::bridge::protocol::PresencePayload {
                state: if on { "composing" } else { "paused" }.to_string(),
                chat_jid: Some(chat_id.to_string()),
            },
        ))
        .await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: &str,
        participant: Option<&str>,
    ) -> Result<()> {
        self.send_command(CommandKind::React(crate::bridge::protocol::ReactPayload {
            chat_jid: chat_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            participant_jid: participant.map(ToString::to_string),
            from_me: Some(false),
        }))
        .await?;
        Ok(())
    }
}

impl WhatsAppChannel {
    /// Start the bridge connection supervisor; reconnects with backoff
    /// until `disconnect` is called
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut attempts: u32 = 0;
            while self.running.load(Ordering::SeqCst) {
                match Self::run_connection(&self).await {
                    Ok(()) => attempts = 0,
                    Err(e) => {
                        tracing::warn!(error = %e, "whatsapp bridge connection error");
                    }
                }
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                attempts += 1;
                tokio::time::sleep(backoff_delay(attempts)).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_conversion() {
        assert_eq!(markdown_to_whatsapp("**bold** and __under__"), "*bold* and _under_");
        assert_eq!(markdown_to_whatsapp("# Title\n- item"), "Title\n• item");
        assert_eq!(
            markdown_to_whatsapp("[site](https://example.test)"),
            "site (https://example.test)"
        );
    }

    #[test]
    fn markdown_preserves_code_blocks() {
        let converted = markdown_to_whatsapp("look:\n```rust\nlet x = **1**;\n```");
        assert!(converted.contains("let x = **1**;"));
    }

    #[tokio::test]
    async fn inbound_payload_parses_to_message() {
        let (bus, _rx) = InboundBus::new("inbound", 8);
        let channel = WhatsAppChannel::new(
            "ws://127.0.0.1:1".to_string(),
            "t".to_string(),
            0,
            bus,
            None,
        );
        let payload = json!({
            "messageId": "M1",
            "chatJid": "G1@g.us",
            "participantJid": "49170@s.whatsapp.net",
            "senderId": "49170@s.whatsapp.net",
            "isGroup": true,
            "text": "hello",
            "timestamp": 1_700_000_000,
            "mentionedJids": [],
            "mentionedBot": true,
            "replyToBot": false,
            "replyToMessageId": "M0",
            "replyToText": "earlier",
        });
        let message = channel.parse_inbound(&payload).await.unwrap();
        assert_eq!(message.channel, "whatsapp");
        assert!(message.is_group);
        assert!(message.mentioned_bot);
        assert_eq!(message.reply_to.as_ref().unwrap().message_id, "M0");
        assert_eq!(message.text_content(), "hello");
    }

    #[tokio::test]
    async fn debounce_coalesces_rapid_texts() {
        let (bus, mut rx) = InboundBus::new("inbound", 8);
        let channel = WhatsAppChannel::new(
            "ws://127.0.0.1:1".to_string(),
            "t".to_string(),
            50,
            bus,
            None,
        );

        for (id, text) in [("m1", "first"), ("m2", "second")] {
            let msg = Message::text("whatsapp", "c1", id, Identity::new("u1"), text);
            WhatsAppChannel::ingest(&channel, msg);
        }

        let merged = rx.recv().await;
        assert_eq!(merged.text_content(), "first\nsecond");
    }

    #[tokio::test]
    async fn commands_bypass_the_debounce() {
        let (bus, mut rx) = InboundBus::new("inbound", 8);
        let channel = WhatsAppChannel::new(
            "ws://127.0.0.1:1".to_string(),
            "t".to_string(),
            5_000,
            bus,
            None,
        );
        WhatsAppChannel::ingest(
            &channel,
            Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "/policy help"),
        );
        // Arrives immediately despite the long window.
        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap();
        assert_eq!(msg.text_content(), "/policy help");
    }
}
