//! Runtime configuration
//!
//! `config.json` is read once at startup and never hot-reloaded; it
//! covers channel enablement, provider credentials, and tuning knobs.
//! `policy.json` is the hot-reloaded policy document and lives in
//! `crate::policy` — the two are deliberately separate.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default inbound/outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Runtime configuration loaded from `config.json` plus environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root data directory (defaults to `~/.attache`)
    pub home: PathBuf,

    /// Channel enablement and credentials
    pub channels: ChannelsConfig,

    /// Bridge listener settings
    pub bridge: BridgeConfig,

    /// Pipeline tuning
    pub pipeline: PipelineConfig,

    /// Responder routes
    pub responder: ResponderConfig,

    /// Long-term memory settings
    pub memory: MemoryConfig,

    /// Inbound archive settings
    pub archive: ArchiveConfig,

    /// Voice synthesis settings
    pub voice: VoiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            channels: ChannelsConfig::default(),
            bridge: BridgeConfig::default(),
            pipeline: PipelineConfig::default(),
            responder: ResponderConfig::default(),
            memory: MemoryConfig::default(),
            archive: ArchiveConfig::default(),
            voice: VoiceConfig::default(),
        }
    }
}

fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("ATTACHE_HOME") {
        return PathBuf::from(home);
    }
    dirs_home().join(".attache")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

/// Channel enablement and credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    /// WhatsApp (via the loopback bridge)
    pub whatsapp: WhatsAppChannelConfig,

    /// Telegram bot API
    pub telegram: TelegramChannelConfig,

    /// Discord webhook/bot
    pub discord: HttpChannelConfig,

    /// Feishu (Lark) bot
    pub feishu: HttpChannelConfig,
}

/// WhatsApp channel adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhatsAppChannelConfig {
    /// Whether the channel is enabled
    pub enabled: bool,

    /// Debounce window for coalescing rapid messages (0 disables)
    pub debounce_ms: u64,

    /// Persist inbound voice notes to disk
    pub persist_inbound_audio: bool,

    /// Accept messages flagged as sent by this account (echo filter
    /// still drops the bridge's own sends)
    pub accept_from_me: bool,

    /// Send read receipts for processed messages
    pub read_receipts: bool,
}

impl Default for WhatsAppChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 2_000,
            persist_inbound_audio: env_flag("ATTACHE_PERSIST_INBOUND_AUDIO", false),
            accept_from_me: env_flag("ATTACHE_ACCEPT_FROM_ME", false),
            read_receipts: env_flag("ATTACHE_READ_RECEIPTS", true),
        }
    }
}

/// Telegram channel adapter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramChannelConfig {
    /// Whether the channel is enabled
    pub enabled: bool,

    /// Bot API token
    pub bot_token: Option<String>,
}

/// Generic HTTP-backed channel settings (Discord, Feishu)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpChannelConfig {
    /// Whether the channel is enabled
    pub enabled: bool,

    /// API token / webhook secret
    pub token: Option<String>,

    /// API base URL override
    pub api_url: Option<String>,
}

/// Bridge listener settings
///
/// Environment takes precedence over `config.json`: `BRIDGE_HOST`,
/// `BRIDGE_PORT`, `BRIDGE_TOKEN`, `AUTH_DIR`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Listener host; must be a loopback address
    pub host: String,

    /// Listener port
    pub port: u16,

    /// Shared secret every command must carry
    pub token: String,

    /// Credential state directory
    pub auth_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BRIDGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("BRIDGE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(18_790),
            token: std::env::var("BRIDGE_TOKEN").unwrap_or_default(),
            auth_dir: std::env::var("AUTH_DIR").ok().map(PathBuf::from),
        }
    }
}

impl BridgeConfig {
    /// Validate that the bridge can start: non-empty token, loopback
    /// host only
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the token is empty or the host is
    /// not a loopback address
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::Config(
                "BRIDGE_TOKEN is required and must be non-empty".to_string(),
            ));
        }
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| Error::Config(format!("BRIDGE_HOST is not an IP address: {}", self.host)))?;
        if !ip.is_loopback() {
            return Err(Error::Config(format!(
                "BRIDGE_HOST must be loopback, got {}",
                self.host
            )));
        }
        Ok(())
    }

    /// WebSocket URL clients use to reach the bridge
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Pipeline tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Orchestrator dedup TTL in seconds
    pub dedup_ttl_seconds: u64,

    /// Orchestrator dedup cache cap
    pub dedup_max_entries: usize,

    /// Reply-thread window depth
    pub reply_context_window_limit: usize,

    /// Ambient window size for group chats
    pub ambient_window_limit: usize,

    /// Max chars per context window line
    pub context_line_max_chars: usize,

    /// Intent words that trigger idea capture
    pub idea_words: Vec<String>,

    /// Intent words that trigger backlog capture
    pub backlog_words: Vec<String>,

    /// Inbound/outbound queue capacity per channel
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_seconds: 600,
            dedup_max_entries: 5_000,
            reply_context_window_limit: 6,
            ambient_window_limit: 8,
            context_line_max_chars: 1_000,
            idea_words: vec![
                "idea".to_string(),
                "idee".to_string(),
                "ideia".to_string(),
            ],
            backlog_words: vec!["backlog".to_string(), "todo".to_string()],
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Responder route settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponderConfig {
    /// API base URL of the model gateway
    pub api_url: Option<String>,

    /// API key
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// Per-call timeout in seconds
    pub timeout_seconds: u64,

    /// Failures within this window trigger suppression
    pub failure_window_seconds: u64,

    /// Failure count that triggers suppression
    pub failure_threshold: u32,

    /// Suppression cooldown in seconds
    pub failure_cooldown_seconds: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 60,
            failure_window_seconds: 120,
            failure_threshold: 3,
            failure_cooldown_seconds: 300,
        }
    }
}

/// Long-term memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Whether capture/recall is enabled at all
    pub enabled: bool,

    /// Channels eligible for capture
    pub capture_channels: Vec<String>,

    /// Capture assistant replies too
    pub capture_assistant: bool,

    /// Minimum extractor confidence
    pub min_confidence: f64,

    /// Minimum extractor salience
    pub min_salience: f64,

    /// Restrict semantic/procedural writes to owners
    pub owner_only_preference: bool,

    /// Recall result limit
    pub recall_limit: usize,

    /// Recency half-life in days
    pub recency_half_life_days: f64,

    /// Lexical score weight
    pub w_lex: f64,

    /// Vector score weight
    pub w_vec: f64,

    /// Salience weight
    pub w_sal: f64,

    /// Recency weight
    pub w_rec: f64,

    /// Embedding endpoint (vector recall disabled when unset)
    pub embedding_url: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_channels: vec!["whatsapp".to_string(), "telegram".to_string()],
            capture_assistant: false,
            min_confidence: 0.6,
            min_salience: 0.3,
            owner_only_preference: false,
            recall_limit: 6,
            recency_half_life_days: 30.0,
            w_lex: 0.35,
            w_vec: 0.35,
            w_sal: 0.15,
            w_rec: 0.15,
            embedding_url: None,
        }
    }
}

/// Inbound archive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveConfig {
    /// Retention window in days
    pub retention_days: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Voice synthesis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceConfig {
    /// TTS endpoint (voice replies disabled when unset)
    pub tts_url: Option<String>,

    /// TTS API key
    pub tts_api_key: Option<String>,

    /// ASR endpoint (voice-note transcripts disabled when unset)
    pub asr_url: Option<String>,

    /// Max raw audio bytes before falling back to text
    pub max_audio_bytes: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_url: None,
            tts_api_key: None,
            asr_url: None,
            max_audio_bytes: 160 * 1024,
        }
    }
}

impl Config {
    /// Load `config.json` from the config root, falling back to
    /// defaults when the file does not exist
    ///
    /// # Errors
    ///
    /// Returns error when the file exists but cannot be parsed
    pub fn load() -> Result<Self> {
        let home = default_home();
        let path = home.join("config.json");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Self>(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.home = home;
        Ok(config)
    }

    /// Path of the hot-reloaded policy document
    #[must_use]
    pub fn policy_path(&self) -> PathBuf {
        self.home.join("policy.json")
    }

    /// Path of the inbound archive database
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.home.join("inbound").join("reply_context.db")
    }

    /// Path of the memory database
    #[must_use]
    pub fn memory_path(&self) -> PathBuf {
        self.home.join("memory").join("memory.db")
    }

    /// Session history directory
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Incoming media root for a channel
    #[must_use]
    pub fn media_incoming_dir(&self, channel: &str) -> PathBuf {
        if let Ok(dir) = std::env::var("MEDIA_INCOMING_DIR") {
            return PathBuf::from(dir).join(channel);
        }
        self.home.join("media").join("incoming").join(channel)
    }

    /// Outgoing media root for a channel (`send_media.mediaPath` must
    /// resolve under this root)
    #[must_use]
    pub fn media_outgoing_dir(&self, channel: &str) -> PathBuf {
        if let Ok(dir) = std::env::var("MEDIA_OUTGOING_DIR") {
            return PathBuf::from(dir).join(channel);
        }
        self.home.join("media").join("outgoing").join(channel)
    }

    /// Bridge credential directory
    #[must_use]
    pub fn bridge_auth_dir(&self) -> PathBuf {
        self.bridge
            .auth_dir
            .clone()
            .unwrap_or_else(|| self.home.join("whatsapp-auth"))
    }

    /// Policy snapshot backup directory used by admin mutations
    #[must_use]
    pub fn policy_backup_dir(&self) -> PathBuf {
        self.home.join("policy-backups")
    }

    /// Admin audit log path
    #[must_use]
    pub fn policy_audit_path(&self) -> PathBuf {
        self.home.join("policy-audit.jsonl")
    }
}

/// Create a directory (and parents) if missing
///
/// # Errors
///
/// Returns error on filesystem failure
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name).map_or(default, |v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_rejects_empty_token() {
        let config = BridgeConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            token: String::new(),
            auth_dir: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bridge_rejects_non_loopback_host() {
        let config = BridgeConfig {
            host: "192.168.1.5".to_string(),
            port: 1,
            token: "secret".to_string(),
            auth_dir: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bridge_accepts_loopback() {
        for host in ["127.0.0.1", "::1"] {
            let config = BridgeConfig {
                host: host.to_string(),
                port: 1,
                token: "secret".to_string(),
                auth_dir: None,
            };
            assert!(config.validate().is_ok(), "{host} should validate");
        }
    }

    #[test]
    fn default_recall_weights_sum_to_one() {
        let m = MemoryConfig::default();
        let sum = m.w_lex + m.w_vec + m.w_sal + m.w_rec;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
