//! Policy document schema (version 2)
//!
//! `policy.json` is parsed strictly: unknown keys are rejected at every
//! nesting level, so typos fail loudly instead of silently relaxing
//! access control. Override levels (`channels[ch].default`,
//! `channels[ch].chats[id]`) carry optional fields; a field that is set
//! fully replaces the lower level's value — lists are replaced, never
//! merged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Schema version this engine understands
pub const POLICY_VERSION: u32 = 2;

/// Who is allowed to send messages to the bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhoCanTalkMode {
    /// Anyone
    Everyone,
    /// Only listed senders
    Allowlist,
    /// Only channel owners
    OwnerOnly,
}

/// When the bot should respond after a message is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenToReplyMode {
    /// Respond to everything
    All,
    /// Never respond
    Off,
    /// DMs always; groups only on mention / reply-to-bot / wake phrase
    MentionOnly,
    /// Only listed senders get replies
    AllowedSenders,
    /// Only channel owners get replies
    OwnerOnly,
}

/// Which tools the model may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedToolsMode {
    /// All known tools
    All,
    /// Only the listed tools
    Allowlist,
}

/// Voice output mode for a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceOutputMode {
    /// Never synthesize (default)
    Text,
    /// Voice only when the inbound was a voice note
    InKind,
    /// Synthesize every reply
    Always,
    /// Alias of text
    Off,
}

impl VoiceOutputMode {
    /// Whether this mode ever produces audio
    #[must_use]
    pub const fn speaks(self) -> bool {
        matches!(self, Self::InKind | Self::Always)
    }
}

/// Resolved who-can-talk policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WhoCanTalk {
    pub mode: WhoCanTalkMode,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl Default for WhoCanTalk {
    fn default() -> Self {
        Self {
            mode: WhoCanTalkMode::Everyone,
            senders: Vec::new(),
        }
    }
}

/// Partial who-can-talk override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WhoCanTalkOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WhoCanTalkMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

/// Resolved when-to-reply policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WhenToReply {
    pub mode: WhenToReplyMode,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl Default for WhenToReply {
    fn default() -> Self {
        Self {
            mode: WhenToReplyMode::All,
            senders: Vec::new(),
        }
    }
}

/// Partial when-to-reply override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WhenToReplyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WhenToReplyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

/// Explicit sender deny-list, evaluated before everything else
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BlockedSenders {
    #[serde(default)]
    pub senders: Vec<String>,
}

/// Partial deny-list override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BlockedSendersOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

/// Resolved allowed-tools policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllowedTools {
    pub mode: AllowedToolsMode,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for AllowedTools {
    fn default() -> Self {
        Self {
            mode: AllowedToolsMode::All,
            tools: Vec::new(),
            deny: Vec::new(),
        }
    }
}

/// Partial allowed-tools override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllowedToolsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AllowedToolsMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

/// Voice input tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoiceInput {
    #[serde(default)]
    pub wake_phrases: Vec<String>,
}

/// Partial voice input override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoiceInputOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_phrases: Option<Vec<String>>,
}

/// Voice output tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoiceOutput {
    pub mode: VoiceOutputMode,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

fn default_voice() -> String {
    "alloy".to_string()
}

const fn default_max_sentences() -> usize {
    2
}

const fn default_max_chars() -> usize {
    150
}

impl Default for VoiceOutput {
    fn default() -> Self {
        Self {
            mode: VoiceOutputMode::Text,
            voice: default_voice(),
            max_sentences: default_max_sentences(),
            max_chars: default_max_chars(),
        }
    }
}

/// Partial voice output override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoiceOutputOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<VoiceOutputMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sentences: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<usize>,
}

/// Resolved voice policy (input + output)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoicePolicy {
    #[serde(default)]
    pub input: VoiceInput,
    #[serde(default)]
    pub output: VoiceOutput,
}

/// Partial voice policy override
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoicePolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<VoiceInputOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<VoiceOutputOverride>,
}

/// Fully resolved chat policy (no optional fields)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatPolicy {
    #[serde(default)]
    pub who_can_talk: WhoCanTalk,
    #[serde(default)]
    pub when_to_reply: WhenToReply,
    #[serde(default)]
    pub blocked_senders: BlockedSenders,
    #[serde(default)]
    pub allowed_tools: AllowedTools,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_file: Option<String>,
    #[serde(default)]
    pub voice: VoicePolicy,
}

/// Partial override at channel-default or specific-chat level
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatPolicyOverride {
    /// Human-only annotation, ignored by evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_can_talk: Option<WhoCanTalkOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_to_reply: Option<WhenToReplyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_senders: Option<BlockedSendersOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<AllowedToolsOverride>,
    #[serde(
        default,
        with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub persona_file: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePolicyOverride>,
}

/// Serde helper distinguishing "absent" from explicit `null`
/// (`"personaFile": null` clears an inherited persona)
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

impl ChatPolicyOverride {
    /// Whether any field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.who_can_talk.is_none()
            && self.when_to_reply.is_none()
            && self.blocked_senders.is_none()
            && self.allowed_tools.is_none()
            && self.persona_file.is_none()
            && self.voice.is_none()
    }

    /// Apply this override onto a resolved policy. Set fields replace
    /// the base values; lists are replaced wholesale.
    pub fn apply(&self, base: &mut ChatPolicy) {
        if let Some(ref o) = self.who_can_talk {
            if let Some(mode) = o.mode {
                base.who_can_talk.mode = mode;
            }
            if let Some(ref senders) = o.senders {
                base.who_can_talk.senders.clone_from(senders);
            }
        }
        if let Some(ref o) = self.when_to_reply {
            if let Some(mode) = o.mode {
                base.when_to_reply.mode = mode;
            }
            if let Some(ref senders) = o.senders {
                base.when_to_reply.senders.clone_from(senders);
            }
        }
        if let Some(ref o) = self.blocked_senders {
            if let Some(ref senders) = o.senders {
                base.blocked_senders.senders.clone_from(senders);
            }
        }
        if let Some(ref o) = self.allowed_tools {
            if let Some(mode) = o.mode {
                base.allowed_tools.mode = mode;
            }
            if let Some(ref tools) = o.tools {
                base.allowed_tools.tools.clone_from(tools);
            }
            if let Some(ref deny) = o.deny {
                base.allowed_tools.deny.clone_from(deny);
            }
        }
        if let Some(ref persona) = self.persona_file {
            base.persona_file.clone_from(persona);
        }
        if let Some(ref o) = self.voice {
            if let Some(ref input) = o.input {
                if let Some(ref phrases) = input.wake_phrases {
                    base.voice.input.wake_phrases.clone_from(phrases);
                }
            }
            if let Some(ref output) = o.output {
                if let Some(mode) = output.mode {
                    base.voice.output.mode = mode;
                }
                if let Some(ref voice) = output.voice {
                    base.voice.output.voice.clone_from(voice);
                }
                if let Some(n) = output.max_sentences {
                    base.voice.output.max_sentences = n;
                }
                if let Some(n) = output.max_chars {
                    base.voice.output.max_chars = n;
                }
            }
        }
    }
}

/// Per-channel policy section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelPolicy {
    #[serde(default)]
    pub default: ChatPolicyOverride,
    #[serde(default)]
    pub chats: BTreeMap<String, ChatPolicyOverride>,
}

/// Runtime behavior for policy handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(default = "default_true")]
    pub reload_on_change: bool,
    #[serde(default = "default_reload_interval")]
    pub reload_check_interval_seconds: f64,
    #[serde(default = "default_admin_rate_limit")]
    pub admin_command_rate_limit_per_minute: u32,
    #[serde(default)]
    pub admin_require_confirm_for_risky: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_reload_interval() -> f64 {
    1.0
}

const fn default_admin_rate_limit() -> u32 {
    30
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            reload_on_change: true,
            reload_check_interval_seconds: default_reload_interval(),
            admin_command_rate_limit_per_minute: default_admin_rate_limit(),
            admin_require_confirm_for_risky: false,
        }
    }
}

impl RuntimePolicy {
    /// Reload probe interval, floored at 100 ms
    #[must_use]
    pub fn reload_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.reload_check_interval_seconds.max(0.1))
    }
}

/// Root policy document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySpec {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub owners: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub runtime: RuntimePolicy,
    #[serde(default)]
    pub defaults: ChatPolicy,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelPolicy>,
}

const fn default_version() -> u32 {
    POLICY_VERSION
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            owners: BTreeMap::new(),
            runtime: RuntimePolicy::default(),
            defaults: ChatPolicy::default(),
            channels: BTreeMap::new(),
        }
    }
}

impl PolicySpec {
    /// Parse and validate a policy document
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` on schema violations or an unsupported
    /// version
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let spec: Self =
            serde_json::from_str(raw).map_err(|e| crate::Error::Policy(e.to_string()))?;
        if spec.version != POLICY_VERSION {
            return Err(crate::Error::Policy(format!(
                "unsupported policy version {} (expected {POLICY_VERSION})",
                spec.version
            )));
        }
        Ok(spec)
    }

    /// Serialize to pretty JSON for on-disk persistence
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Resolve the effective policy for one `(channel, chat)` pair:
    /// built-in defaults ← `defaults` ← channel default ← chat override
    #[must_use]
    pub fn resolve(&self, channel: &str, chat_id: &str) -> ChatPolicy {
        let mut resolved = self.defaults.clone();
        if let Some(channel_policy) = self.channels.get(channel) {
            channel_policy.default.apply(&mut resolved);
            if let Some(chat_override) = channel_policy.chats.get(chat_id) {
                chat_override.apply(&mut resolved);
            }
        }
        resolved
    }
}
