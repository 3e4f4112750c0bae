//! WhatsApp bridge session
//!
//! Owns the live platform socket (behind the narrow `PlatformClient`
//! seam), the dedup/quote/outbound-self caches, QR login state, and the
//! reconnect supervisor. Raw platform payloads are normalized into the
//! protocol's `message` events here.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};

use super::protocol::{Command, CommandKind, ErrorCode, Event, ProtocolError, PROTOCOL_VERSION};
use crate::cache::{DedupCache, TtlCache};
use crate::lifecycle::Shutdown;
use crate::media::MediaStorage;
use crate::Result;

/// Dedup cache TTL (20 minutes)
const DEDUP_TTL: Duration = Duration::from_secs(20 * 60);
/// Dedup cache cap
const DEDUP_MAX: usize = 5_000;
/// Quote cache TTL (20 minutes)
const QUOTE_TTL: Duration = Duration::from_secs(20 * 60);
/// Quote cache cap
const QUOTE_MAX: usize = 2_000;
/// Outbound-self cache TTL (10 minutes)
const SELF_TTL: Duration = Duration::from_secs(10 * 60);
/// Outbound-self cache cap
const SELF_MAX: usize = 5_000;
/// QR freshness window
const QR_FRESH: Duration = Duration::from_secs(120);
/// Reconnect attempts before giving up
const MAX_RECONNECT_ATTEMPTS: u32 = 30;
/// Nested envelope unwrap depth
const MAX_UNWRAP_DEPTH: usize = 6;
/// Quoted text truncation
const QUOTE_TEXT_MAX: usize = 1_000;
/// Image download retry backoff schedule
const IMAGE_RETRY_MS: &[u64] = &[250, 500, 1_000];

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@(\d{5,})").unwrap());

/// Events surfaced by the platform socket
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// Socket opened and authenticated
    Connected,
    /// A login QR code was issued
    Qr(String),
    /// Credential files changed on disk
    CredsUpdate,
    /// One raw inbound message payload
    Message(Value),
    /// Socket closed (with the platform status code when known)
    Closed { status: Option<i64> },
}

/// Narrow seam over the WhatsApp SDK socket
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Open one connection; the receiver yields events until close
    async fn connect(&self) -> Result<mpsc::Receiver<PlatformEvent>>;

    /// Send a text message; returns the platform message id
    async fn send_text(&self, to: &str, text: &str, quoted: Option<&Value>) -> Result<String>;

    /// Send a media message; returns the platform message id
    async fn send_media(
        &self,
        to: &str,
        bytes: Vec<u8>,
        mime_type: Option<&str>,
        file_name: Option<&str>,
        caption: Option<&str>,
        quoted: Option<&Value>,
    ) -> Result<String>;

    /// Send a poll; returns the platform message id
    async fn send_poll(
        &self,
        to: &str,
        question: &str,
        options: &[String],
        max_selections: u32,
    ) -> Result<String>;

    /// React to a message
    async fn react(
        &self,
        chat_jid: &str,
        message_id: &str,
        emoji: &str,
        participant: Option<&str>,
        from_me: bool,
    ) -> Result<()>;

    /// Update presence
    async fn presence(&self, state: &str, chat_jid: Option<&str>) -> Result<()>;

    /// List joined groups
    async fn list_groups(&self, ids: Option<&[String]>) -> Result<Value>;

    /// Send a read receipt
    async fn mark_read(&self, chat_jid: &str, message_id: &str, participant: Option<&str>)
        -> Result<()>;

    /// Download a message's media bytes
    async fn download_media(&self, raw: &Value) -> Result<Vec<u8>>;

    /// Log out and clear credentials
    async fn logout(&self) -> Result<()>;

    /// JIDs this account is reachable under
    fn self_jids(&self) -> Vec<String>;
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub account_id: String,
    pub accept_from_me: bool,
    pub read_receipts: bool,
    pub persist_audio: bool,
    pub persist_video: bool,
    pub persist_sticker: bool,
    pub auth_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            accept_from_me: false,
            read_receipts: true,
            persist_audio: false,
            persist_video: false,
            persist_sticker: false,
            auth_dir: None,
        }
    }
}

struct SessionState {
    recent_inbound: DedupCache<String>,
    quote_cache: TtlCache<String, Value>,
    outbound_self: TtlCache<String, ()>,
    qr: Option<(String, Instant)>,
    connected: bool,
    running: bool,
    reconnect_attempts: u32,
    last_disconnect_status: Option<i64>,
    last_error: Option<String>,
    last_message_at: Option<i64>,
    dropped_inbound_duplicates: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            recent_inbound: DedupCache::new(DEDUP_TTL, DEDUP_MAX),
            quote_cache: TtlCache::new(QUOTE_TTL, QUOTE_MAX),
            outbound_self: TtlCache::new(SELF_TTL, SELF_MAX),
            qr: None,
            connected: false,
            running: false,
            reconnect_attempts: 0,
            last_disconnect_status: None,
            last_error: None,
            last_message_at: None,
            dropped_inbound_duplicates: 0,
        }
    }
}

/// One WhatsApp account session
pub struct BridgeSession {
    client: Arc<dyn PlatformClient>,
    config: SessionConfig,
    media: Option<MediaStorage>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<Event>,
    qr_notify: tokio::sync::Notify,
}

impl BridgeSession {
    /// Create a session over a platform client
    #[must_use]
    pub fn new(
        client: Arc<dyn PlatformClient>,
        config: SessionConfig,
        media: Option<MediaStorage>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            client,
            config,
            media,
            state: Mutex::new(SessionState::new()),
            events,
            qr_notify: tokio::sync::Notify::new(),
        })
    }

    /// Subscribe to bridge events (`message`, `status`, `qr`, `error`)
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    // ── Connection supervisor ────────────────────────────────────────

    /// Run the connect/reconnect loop until shutdown or exhaustion
    pub async fn run(self: Arc<Self>, shutdown: Arc<Shutdown>) {
        self.lock().running = true;
        loop {
            if shutdown.is_draining() {
                break;
            }

            match self.client.connect().await {
                Ok(mut rx) => {
                    while let Some(event) = rx.recv().await {
                        if self.handle_platform_event(event).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.lock().last_error = Some(e.to_string());
                    tracing::warn!(error = %e, "bridge connect failed");
                }
            }

            {
                let mut state = self.lock();
                state.connected = false;
                state.reconnect_attempts += 1;
                if state.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                    drop(state);
                    tracing::error!(attempts = MAX_RECONNECT_ATTEMPTS, "bridge reconnect exhausted");
                    self.emit(Event::new(
                        "status",
                        &self.config.account_id,
                        None,
                        json!({"status": "reconnect_exhausted"}),
                    ));
                    break;
                }
            }

            if shutdown.is_draining() {
                break;
            }
            let attempt = self.lock().reconnect_attempts;
            let delay = backoff_delay(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "bridge reconnecting");
            tokio::time::sleep(delay).await;
        }
        self.lock().running = false;
    }

    /// Returns true when the connection closed
    async fn handle_platform_event(&self, event: PlatformEvent) -> bool {
        match event {
            PlatformEvent::Connected => {
                let mut state = self.lock();
                state.connected = true;
                state.reconnect_attempts = 0;
                drop(state);
                self.emit(Event::new(
                    "status",
                    &self.config.account_id,
                    None,
                    json!({"status": "open"}),
                ));
                false
            }
            PlatformEvent::Qr(code) => {
                self.latch_qr(code.clone());
                self.emit(Event::new(
                    "qr",
                    &self.config.account_id,
                    None,
                    json!({"qr": code}),
                ));
                false
            }
            PlatformEvent::CredsUpdate => {
                if let Some(ref dir) = self.config.auth_dir {
                    if let Err(e) = crate::media::enforce_private_tree(dir) {
                        tracing::warn!(error = %e, "auth dir permission enforcement failed");
                    }
                }
                false
            }
            PlatformEvent::Message(raw) => {
                if let Some(payload) = self.process_inbound(&raw).await {
                    self.emit(Event::new("message", &self.config.account_id, None, payload));
                }
                false
            }
            PlatformEvent::Closed { status } => {
                let mut state = self.lock();
                state.connected = false;
                state.last_disconnect_status = status;
                true
            }
        }
    }

    /// Latch a QR string for pending login waiters
    pub fn latch_qr(&self, code: String) {
        self.lock().qr = Some((code, Instant::now()));
        self.qr_notify.notify_waiters();
    }

    fn fresh_qr(&self) -> Option<String> {
        let state = self.lock();
        state
            .qr
            .as_ref()
            .filter(|(_, at)| at.elapsed() < QR_FRESH)
            .map(|(code, _)| code.clone())
    }

    /// Wait up to `timeout` for a fresh QR string
    pub async fn wait_for_qr(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.fresh_qr() {
                return Some(code);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, self.qr_notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    // ── Inbound processing ───────────────────────────────────────────

    /// Normalize one raw platform payload into a `message` event
    /// payload. Returns `None` for dropped messages.
    pub async fn process_inbound(&self, raw: &Value) -> Option<Value> {
        let key = raw.get("key")?;
        let remote_jid_raw = key.get("remoteJid").and_then(Value::as_str).unwrap_or("");

        // 1. Status broadcasts and empty chats are noise.
        if remote_jid_raw.is_empty() || remote_jid_raw == "status@broadcast" {
            return None;
        }

        // 2. Normalize the chat JID.
        let chat_jid = normalize_jid(remote_jid_raw);
        let message_id = key.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if message_id.is_empty() {
            return None;
        }

        // 3. fromMe gate: echoes of our own bridge sends are always
        // dropped; other devices of the same account only pass when
        // configured.
        let from_me = key.get("fromMe").and_then(Value::as_bool).unwrap_or(false);
        if from_me {
            let own_send = self.lock().outbound_self.contains(&message_id);
            if own_send || !self.config.accept_from_me {
                return None;
            }
        }

        // 4. Cache the raw payload for later reply-quote resolution.
        self.lock()
            .quote_cache
            .insert(quote_key(&chat_jid, &message_id), raw.clone());

        // 5. Dedup on the hashed (chat, message) pair.
        {
            let mut state = self.lock();
            let digest = inbound_digest(&chat_jid, &message_id);
            if state.recent_inbound.check_and_insert(digest) {
                state.dropped_inbound_duplicates += 1;
                return None;
            }
        }

        // 6. Group detection.
        let is_group = chat_jid.ends_with("@g.us");

        // 7. Participant resolution. In 1:1 chats the sender IS the
        // remote JID; contextInfo.participant names a quoted author and
        // must never be used here.
        let participant = if is_group {
            key.get("participant")
                .or_else(|| raw.get("participant"))
                .and_then(Value::as_str)
                .map_or_else(|| chat_jid.clone(), normalize_jid)
        } else {
            chat_jid.clone()
        };

        // 8. Unwrap nested envelopes.
        let message = unwrap_message(raw.get("message")?);

        // 9. Text and media extraction.
        let (text, media_kind, media_meta) = extract_content(message);
        if text.is_empty() && media_kind.is_none() {
            return None;
        }

        // 10. Reply metadata.
        let context_info = find_context_info(message);
        let (reply_to_message_id, reply_to_participant, reply_to_text) =
            extract_reply_meta(context_info);

        // 11. Mentions.
        let self_jids: Vec<String> = self
            .client
            .self_jids()
            .iter()
            .map(|j| normalize_jid(j))
            .collect();
        let mentioned_jids = extract_mentions(context_info, &text);
        let mentioned_bot = mentioned_jids.iter().any(|jid| {
            let normalized = normalize_jid(jid);
            self_jids
                .iter()
                .any(|own| own == &normalized || jid_user(own) == jid_user(&normalized))
        });
        let reply_to_bot = reply_to_participant
            .as_deref()
            .map(normalize_jid)
            .is_some_and(|quoted| {
                self_jids
                    .iter()
                    .any(|own| own == &quoted || jid_user(own) == jid_user(&quoted))
            });

        // 12. Media persistence for configured kinds.
        let media_payload = match media_kind {
            Some(kind) => {
                self.persist_media(raw, kind, &message_id, media_meta.as_ref())
                    .await
            }
            None => None,
        };

        // 13. Read receipts.
        if self.config.read_receipts {
            let read_participant = is_group.then_some(participant.as_str());
            if let Err(e) = self
                .client
                .mark_read(&chat_jid, &message_id, read_participant)
                .await
            {
                tracing::debug!(error = %e, "read receipt failed");
            }
        }

        let timestamp = raw
            .get("messageTimestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        self.lock().last_message_at = Some(timestamp);

        // 14. Emit.
        let mut payload = json!({
            "messageId": message_id,
            "chatJid": chat_jid,
            "participantJid": participant,
            "senderId": participant,
            "isGroup": is_group,
            "text": text,
            "timestamp": timestamp,
            "mentionedJids": mentioned_jids,
            "mentionedBot": mentioned_bot,
            "replyToBot": reply_to_bot,
        });
        if let Some(id) = reply_to_message_id {
            payload["replyToMessageId"] = json!(id);
        }
        if let Some(p) = reply_to_participant {
            payload["replyToParticipantJid"] = json!(normalize_jid(&p));
        }
        if let Some(t) = reply_to_text {
            payload["replyToText"] = json!(t);
        }
        if let Some(media) = media_payload {
            payload["media"] = media;
        }
        Some(payload)
    }

    async fn persist_media(
        &self,
        raw: &Value,
        kind: &'static str,
        message_id: &str,
        meta: Option<&Value>,
    ) -> Option<Value> {
        let mime_type = meta
            .and_then(|m| m.get("mimetype"))
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let wanted = match kind {
            "image" => true,
            "audio" => self.config.persist_audio,
            "video" => self.config.persist_video,
            "sticker" => self.config.persist_sticker,
            _ => false,
        };

        let mut media = json!({"kind": kind});
        if let Some(ref mime) = mime_type {
            media["mimeType"] = json!(mime);
        }

        if !wanted {
            return Some(media);
        }
        let storage = self.media.as_ref()?;

        // Images retry on a fixed backoff schedule; transient CDN
        // failures are common right after delivery.
        let attempts = if kind == "image" { IMAGE_RETRY_MS.len() } else { 1 };
        let mut bytes = None;
        for attempt in 0..attempts {
            match self.client.download_media(raw).await {
                Ok(b) => {
                    bytes = Some(b);
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, kind, "media download failed");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(IMAGE_RETRY_MS[attempt])).await;
                    }
                }
            }
        }
        let bytes = bytes?;

        let ext = mime_type
            .as_deref()
            .and_then(|m| m.split('/').nth(1))
            .map(|s| s.split(';').next().unwrap_or(s))
            .unwrap_or("bin");
        match storage.persist_incoming(message_id, ext, &bytes) {
            Ok(path) => {
                media["path"] = json!(path.display().to_string());
                media["bytes"] = json!(bytes.len());
            }
            Err(e) => {
                tracing::warn!(error = %e, "media persist failed");
            }
        }
        Some(media)
    }

    // ── Command dispatch ─────────────────────────────────────────────

    /// Execute one validated command; returns the response payload
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` for dispatch failures
    pub async fn handle_command(&self, command: &Command) -> std::result::Result<Value, ProtocolError> {
        let internal = |e: crate::Error| ProtocolError {
            code: ErrorCode::Internal,
            message: e.to_string(),
            retryable: true,
        };

        match &command.kind {
            CommandKind::SendText(p) => {
                let quoted = p
                    .reply_to_message_id
                    .as_deref()
                    .and_then(|id| self.resolve_quote(&p.to, id));
                let sent_id = self
                    .client
                    .send_text(&p.to, &p.text, quoted.as_ref())
                    .await
                    .map_err(internal)?;
                self.record_outbound(&sent_id);
                Ok(json!({"messageId": sent_id}))
            }
            CommandKind::SendMedia(p) => {
                let bytes = self.load_media_source(p).await?;
                let quoted = p
                    .reply_to_message_id
                    .as_deref()
                    .and_then(|id| self.resolve_quote(&p.to, id));
                let sent_id = self
                    .client
                    .send_media(
                        &p.to,
                        bytes,
                        p.mime_type.as_deref(),
                        p.file_name.as_deref(),
                        p.caption.as_deref(),
                        quoted.as_ref(),
                    )
                    .await
                    .map_err(internal)?;
                self.record_outbound(&sent_id);
                Ok(json!({"messageId": sent_id}))
            }
            CommandKind::SendPoll(p) => {
                let sent_id = self
                    .client
                    .send_poll(&p.to, &p.question, &p.options, p.max_selections.unwrap_or(1))
                    .await
                    .map_err(internal)?;
                self.record_outbound(&sent_id);
                Ok(json!({"messageId": sent_id}))
            }
            CommandKind::React(p) => {
                self.client
                    .react(
                        &p.chat_jid,
                        &p.message_id,
                        &p.emoji,
                        p.participant_jid.as_deref(),
                        p.from_me.unwrap_or(false),
                    )
                    .await
                    .map_err(internal)?;
                Ok(json!({"ok": true}))
            }
            CommandKind::PresenceUpdate(p) => {
                self.client
                    .presence(&p.state, p.chat_jid.as_deref())
                    .await
                    .map_err(internal)?;
                Ok(json!({"ok": true}))
            }
            CommandKind::ListGroups(p) => {
                let groups = self
                    .client
                    .list_groups(p.ids.as_deref())
                    .await
                    .map_err(internal)?;
                Ok(json!({"groups": groups}))
            }
            CommandKind::LoginStart(p) => {
                let timeout = Duration::from_millis(p.timeout_ms.unwrap_or(60_000));
                match self.wait_for_qr(timeout).await {
                    Some(qr) => Ok(json!({"qr": qr, "connected": self.lock().connected})),
                    None => Ok(json!({"qr": Value::Null, "connected": self.lock().connected})),
                }
            }
            CommandKind::LoginWait(p) => {
                let timeout = Duration::from_millis(p.timeout_ms.unwrap_or(60_000));
                match self.wait_for_qr(timeout).await {
                    Some(qr) => Ok(json!({"qr": qr, "connected": self.lock().connected})),
                    None => Ok(json!({"qr": Value::Null, "connected": self.lock().connected})),
                }
            }
            CommandKind::Logout => {
                self.client.logout().await.map_err(internal)?;
                Ok(json!({"ok": true}))
            }
            CommandKind::Health => Ok(self.health_snapshot()),
        }
    }

    async fn load_media_source(
        &self,
        p: &super::protocol::SendMediaPayload,
    ) -> std::result::Result<Vec<u8>, ProtocolError> {
        use base64::Engine;
        let schema = |message: String| ProtocolError {
            code: ErrorCode::Schema,
            message,
            retryable: false,
        };

        if let Some(ref b64) = p.media_base64 {
            return base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| schema(format!("invalid mediaBase64: {e}")));
        }
        if let Some(ref url) = p.media_url {
            let bytes = reqwest::get(url)
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| ProtocolError {
                    code: ErrorCode::Internal,
                    message: format!("media fetch failed: {e}"),
                    retryable: true,
                })?
                .bytes()
                .await
                .map_err(|e| ProtocolError {
                    code: ErrorCode::Internal,
                    message: format!("media fetch failed: {e}"),
                    retryable: true,
                })?;
            return Ok(bytes.to_vec());
        }
        if let Some(ref path) = p.media_path {
            let storage = self.media.as_ref().ok_or_else(|| {
                schema("mediaPath is not supported without an outgoing media root".to_string())
            })?;
            let resolved = storage
                .resolve_outgoing(path)
                .map_err(|e| schema(e.to_string()))?;
            return std::fs::read(&resolved).map_err(|e| schema(format!("unreadable media: {e}")));
        }
        Err(schema("no media source".to_string()))
    }

    /// Resolve a quoted message from the quote cache
    #[must_use]
    pub fn resolve_quote(&self, chat_jid: &str, message_id: &str) -> Option<Value> {
        self.lock()
            .quote_cache
            .get(&quote_key(&normalize_jid(chat_jid), message_id))
            .cloned()
    }

    /// Record a message id this bridge just sent, so the inbound path
    /// recognizes the echo
    pub fn record_outbound(&self, message_id: &str) {
        self.lock().outbound_self.insert(message_id.to_string(), ());
    }

    /// Health snapshot per the protocol contract
    #[must_use]
    pub fn health_snapshot(&self) -> Value {
        let state = self.lock();
        json!({
            "version": PROTOCOL_VERSION,
            "protocolVersion": PROTOCOL_VERSION,
            "bridgeVersion": env!("CARGO_PKG_VERSION"),
            "buildId": option_env!("BUILD_ID").unwrap_or("dev"),
            "accountId": self.config.account_id,
            "whatsapp": {
                "connected": state.connected,
                "running": state.running,
                "reconnectAttempts": state.reconnect_attempts,
                "lastDisconnectStatus": state.last_disconnect_status,
                "lastError": state.last_error,
                "lastMessageAt": state.last_message_at,
                "droppedInboundDuplicates": state.dropped_inbound_duplicates,
                "dedupeCacheSize": state.recent_inbound.len(),
            },
            "dedupe": {
                "droppedInboundDuplicates": state.dropped_inbound_duplicates,
                "dedupeCacheSize": state.recent_inbound.len(),
            },
        })
    }
}

/// Reconnect backoff: 1 s initial, ×2 per attempt, 30 s cap, ±25 % jitter
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(30_000);
    let jitter_span = base_ms / 4;
    let jitter = rand::thread_rng().gen_range(0..=jitter_span * 2);
    Duration::from_millis(base_ms - jitter_span + jitter)
}

/// Normalize a JID: drop the `:device` suffix on the user part,
/// lowercase the domain
#[must_use]
pub fn normalize_jid(jid: &str) -> String {
    match jid.split_once('@') {
        Some((user, domain)) => {
            let user = user.split(':').next().unwrap_or(user);
            format!("{user}@{}", domain.to_lowercase())
        }
        None => jid.to_string(),
    }
}

fn jid_user(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

fn quote_key(chat_jid: &str, message_id: &str) -> String {
    format!("{chat_jid}:{message_id}")
}

fn inbound_digest(chat_jid: &str, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chat_jid.as_bytes());
    hasher.update(b":");
    hasher.update(message_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Unwrap nested message envelopes (ephemeral, view-once,
/// document-with-caption) up to a fixed depth
#[must_use]
pub fn unwrap_message(message: &Value) -> &Value {
    const WRAPPERS: &[&str] = &[
        "ephemeralMessage",
        "viewOnceMessage",
        "viewOnceMessageV2",
        "viewOnceMessageV2Extension",
        "documentWithCaptionMessage",
    ];
    let mut current = message;
    for _ in 0..MAX_UNWRAP_DEPTH {
        let mut unwrapped = None;
        for wrapper in WRAPPERS {
            if let Some(inner) = current.get(wrapper).and_then(|w| w.get("message")) {
                unwrapped = Some(inner);
                break;
            }
        }
        match unwrapped {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

/// Extract text, media kind, and media metadata from an unwrapped
/// message
fn extract_content(message: &Value) -> (String, Option<&'static str>, Option<Value>) {
    if let Some(text) = message.get("conversation").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return (text.trim().to_string(), None, None);
        }
    }
    if let Some(text) = message
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        if !text.trim().is_empty() {
            return (text.trim().to_string(), None, None);
        }
    }

    const MEDIA: &[(&str, &str, &str)] = &[
        ("imageMessage", "image", "[Image]"),
        ("audioMessage", "audio", "[Voice Message]"),
        ("videoMessage", "video", "[Video]"),
        ("stickerMessage", "sticker", "[Sticker]"),
        ("documentMessage", "document", "[Document]"),
    ];
    for (field, kind, placeholder) in MEDIA {
        if let Some(meta) = message.get(*field) {
            let caption = meta
                .get("caption")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty());
            let text = caption.map_or_else(|| (*placeholder).to_string(), ToString::to_string);
            return (text, Some(*kind), Some(meta.clone()));
        }
    }

    (String::new(), None, None)
}

/// Find the `contextInfo` block wherever the message type put it
fn find_context_info(message: &Value) -> Option<&Value> {
    const CARRIERS: &[&str] = &[
        "extendedTextMessage",
        "imageMessage",
        "audioMessage",
        "videoMessage",
        "stickerMessage",
        "documentMessage",
    ];
    for carrier in CARRIERS {
        if let Some(info) = message.get(*carrier).and_then(|m| m.get("contextInfo")) {
            return Some(info);
        }
    }
    message.get("contextInfo")
}

/// Extract reply metadata (quoted id, author, normalized quoted text)
fn extract_reply_meta(context_info: Option<&Value>) -> (Option<String>, Option<String>, Option<String>) {
    let Some(info) = context_info else {
        return (None, None, None);
    };
    let stanza_id = info
        .get("stanzaId")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .filter(|s| !s.is_empty());
    let participant = info
        .get("participant")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .filter(|s| !s.is_empty());
    let quoted_text = info.get("quotedMessage").map(unwrap_message).and_then(|quoted| {
        let (text, _, _) = extract_content(quoted);
        if text.is_empty() {
            None
        } else {
            Some(text.chars().take(QUOTE_TEXT_MAX).collect::<String>())
        }
    });
    (stanza_id, participant, quoted_text)
}

/// Extract mentioned JIDs from `contextInfo.mentionedJid` plus
/// `@<digits>` patterns in the text
fn extract_mentions(context_info: Option<&Value>, text: &str) -> Vec<String> {
    let mut mentions: Vec<String> = context_info
        .and_then(|info| info.get("mentionedJid"))
        .and_then(Value::as_array)
        .map(|jids| {
            jids.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    for captures in MENTION_RE.captures_iter(text) {
        if let Some(digits) = captures.get(1) {
            let jid = format!("{}@s.whatsapp.net", digits.as_str());
            if !mentions.contains(&jid) {
                mentions.push(jid);
            }
        }
    }
    mentions
}
