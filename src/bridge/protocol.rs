//! Bridge wire protocol (v2)
//!
//! Loopback WebSocket envelopes between the bridge and its clients.
//! Commands flow client → bridge, events bridge → client. Dynamic
//! payloads are parsed into one `Command` sum type; anything malformed
//! becomes a typed `ProtocolError` instead of a panic or a silent drop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version constant
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum accepted command frame size (256 KB)
pub const MAX_COMMAND_BYTES: usize = 256 * 1024;

/// Error kinds carried by `error` events and command responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_PROTOCOL_VERSION")]
    ProtocolVersion,
    #[serde(rename = "ERR_SCHEMA")]
    Schema,
    #[serde(rename = "ERR_AUTH")]
    Auth,
    #[serde(rename = "ERR_UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "ERR_PAYLOAD_TOO_LARGE")]
    PayloadTooLarge,
    #[serde(rename = "ERR_QUEUE_OVERFLOW")]
    QueueOverflow,
    #[serde(rename = "ERR_INTERNAL")]
    Internal,
}

/// Protocol-level failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ProtocolError {
    /// Build an error, sanitizing any token substring out of the text
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool, token: &str) -> Self {
        Self {
            code,
            message: sanitize_error_message(&message.into(), token),
            retryable,
        }
    }
}

/// Replace occurrences of the shared secret with `***`
#[must_use]
pub fn sanitize_error_message(message: &str, token: &str) -> String {
    if token.is_empty() {
        return message.to_string();
    }
    message.replace(token, "***")
}

/// Constant-time byte comparison for the auth token
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// `send_text` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendTextPayload {
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// `send_media` payload; exactly one media source must be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMediaPayload {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// `send_poll` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendPollPayload {
    pub to: String,
    pub question: String,
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_selections: Option<u32>,
}

/// `react` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReactPayload {
    pub chat_jid: String,
    pub message_id: String,
    pub emoji: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_me: Option<bool>,
}

/// `presence_update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PresencePayload {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_jid: Option<String>,
}

/// `list_groups` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListGroupsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

/// `login_start` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoginStartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `login_wait` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoginWaitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Validated command kind + payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    SendText(SendTextPayload),
    SendMedia(SendMediaPayload),
    SendPoll(SendPollPayload),
    React(ReactPayload),
    PresenceUpdate(PresencePayload),
    ListGroups(ListGroupsPayload),
    LoginStart(LoginStartPayload),
    LoginWait(LoginWaitPayload),
    Logout,
    Health,
}

impl CommandKind {
    /// Wire name of the command type
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SendText(_) => "send_text",
            Self::SendMedia(_) => "send_media",
            Self::SendPoll(_) => "send_poll",
            Self::React(_) => "react",
            Self::PresenceUpdate(_) => "presence_update",
            Self::ListGroups(_) => "list_groups",
            Self::LoginStart(_) => "login_start",
            Self::LoginWait(_) => "login_wait",
            Self::Logout => "logout",
            Self::Health => "health",
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            Self::SendText(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::SendMedia(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::SendPoll(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::React(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::PresenceUpdate(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::ListGroups(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::LoginStart(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::LoginWait(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::Logout | Self::Health => json!({}),
        }
    }
}

/// One validated client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub request_id: Option<String>,
    pub account_id: Option<String>,
    pub kind: CommandKind,
}

impl Command {
    /// Serialize to the wire envelope (client side)
    #[must_use]
    pub fn to_wire(&self, token: &str) -> Value {
        let mut envelope = json!({
            "version": PROTOCOL_VERSION,
            "type": self.kind.type_name(),
            "token": token,
            "payload": self.kind.payload_value(),
        });
        if let Some(ref request_id) = self.request_id {
            envelope["requestId"] = json!(request_id);
        }
        if let Some(ref account_id) = self.account_id {
            envelope["accountId"] = json!(account_id);
        }
        envelope
    }
}

/// One bridge → client event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub payload: Value,
}

impl Event {
    /// Build an event stamped with the current time
    #[must_use]
    pub fn new(kind: &str, account_id: &str, request_id: Option<String>, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind.to_string(),
            ts: Utc::now().timestamp_millis(),
            account_id: account_id.to_string(),
            request_id,
            payload,
        }
    }

    /// Error event
    #[must_use]
    pub fn error(account_id: &str, request_id: Option<String>, error: &ProtocolError) -> Self {
        Self::new(
            "error",
            account_id,
            request_id,
            serde_json::to_value(error).unwrap_or_default(),
        )
    }

    /// Command response event
    #[must_use]
    pub fn response(account_id: &str, request_id: Option<String>, payload: Value) -> Self {
        Self::new("response", account_id, request_id, payload)
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    version: Option<u32>,
    #[serde(rename = "type")]
    kind: Option<String>,
    token: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(rename = "accountId")]
    account_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Parse and validate one command frame
///
/// # Errors
///
/// Returns a typed `ProtocolError` on size, version, auth, or schema
/// violations
pub fn parse_command(raw: &str, expected_token: &str) -> Result<Command, ProtocolError> {
    if raw.len() > MAX_COMMAND_BYTES {
        return Err(ProtocolError::new(
            ErrorCode::PayloadTooLarge,
            format!("command frame of {} bytes exceeds {MAX_COMMAND_BYTES}", raw.len()),
            false,
            expected_token,
        ));
    }

    let envelope: RawEnvelope = serde_json::from_str(raw).map_err(|e| {
        ProtocolError::new(ErrorCode::Schema, format!("invalid JSON: {e}"), false, expected_token)
    })?;

    if envelope.version != Some(PROTOCOL_VERSION) {
        return Err(ProtocolError::new(
            ErrorCode::ProtocolVersion,
            format!(
                "expected protocol version {PROTOCOL_VERSION}, got {:?}",
                envelope.version
            ),
            false,
            expected_token,
        ));
    }

    let token = envelope.token.unwrap_or_default();
    if !constant_time_eq(token.as_bytes(), expected_token.as_bytes()) {
        return Err(ProtocolError::new(
            ErrorCode::Auth,
            "invalid token",
            false,
            expected_token,
        ));
    }

    let kind_name = envelope.kind.unwrap_or_default();
    let payload = envelope.payload;
    let schema_err = |message: String| {
        ProtocolError::new(ErrorCode::Schema, message, false, expected_token)
    };

    let kind = match kind_name.as_str() {
        "send_text" => {
            let p: SendTextPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.to.trim().is_empty() || p.text.trim().is_empty() {
                return Err(schema_err("send_text requires non-empty to and text".to_string()));
            }
            CommandKind::SendText(p)
        }
        "send_media" => {
            let p: SendMediaPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.to.trim().is_empty() {
                return Err(schema_err("send_media requires non-empty to".to_string()));
            }
            let sources = [&p.media_url, &p.media_base64, &p.media_path]
                .iter()
                .filter(|s| s.is_some())
                .count();
            if sources != 1 {
                return Err(schema_err(
                    "send_media requires exactly one of mediaUrl, mediaBase64, mediaPath"
                        .to_string(),
                ));
            }
            CommandKind::SendMedia(p)
        }
        "send_poll" => {
            let p: SendPollPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.to.trim().is_empty() || p.question.trim().is_empty() {
                return Err(schema_err("send_poll requires to and question".to_string()));
            }
            if p.options.len() < 2 || p.options.len() > 12 {
                return Err(schema_err("send_poll requires 2..=12 options".to_string()));
            }
            if let Some(max) = p.max_selections {
                if !(1..=12).contains(&max) {
                    return Err(schema_err("maxSelections must be in 1..=12".to_string()));
                }
            }
            CommandKind::SendPoll(p)
        }
        "react" => {
            let p: ReactPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.chat_jid.trim().is_empty() || p.message_id.trim().is_empty() {
                return Err(schema_err("react requires chatJid and messageId".to_string()));
            }
            CommandKind::React(p)
        }
        "presence_update" => {
            let p: PresencePayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            const STATES: &[&str] = &["available", "unavailable", "composing", "paused", "recording"];
            if !STATES.contains(&p.state.as_str()) {
                return Err(schema_err(format!("unknown presence state: {}", p.state)));
            }
            if matches!(p.state.as_str(), "composing" | "paused" | "recording")
                && p.chat_jid.as_deref().unwrap_or("").trim().is_empty()
            {
                return Err(schema_err(format!("presence {} requires chatJid", p.state)));
            }
            CommandKind::PresenceUpdate(p)
        }
        "list_groups" => {
            let p: ListGroupsPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            CommandKind::ListGroups(p)
        }
        "login_start" => {
            let p: LoginStartPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.timeout_ms.is_some_and(|t| t < 1_000) {
                return Err(schema_err("timeoutMs must be >= 1000".to_string()));
            }
            CommandKind::LoginStart(p)
        }
        "login_wait" => {
            let p: LoginWaitPayload =
                serde_json::from_value(payload).map_err(|e| schema_err(e.to_string()))?;
            if p.timeout_ms.is_some_and(|t| t < 1_000) {
                return Err(schema_err("timeoutMs must be >= 1000".to_string()));
            }
            CommandKind::LoginWait(p)
        }
        "logout" => CommandKind::Logout,
        "health" => CommandKind::Health,
        other => {
            return Err(ProtocolError::new(
                ErrorCode::Unsupported,
                format!("unsupported command type: {other}"),
                false,
                expected_token,
            ));
        }
    };

    Ok(Command {
        request_id: envelope.request_id,
        account_id: envelope.account_id,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "topsecret";

    fn frame(kind: &str, payload: Value) -> String {
        json!({
            "version": PROTOCOL_VERSION,
            "type": kind,
            "token": TOKEN,
            "requestId": "r1",
            "payload": payload,
        })
        .to_string()
    }

    #[test]
    fn send_text_round_trips() {
        let cmd = parse_command(
            &frame("send_text", json!({"to": "123@s.whatsapp.net", "text": "hi"})),
            TOKEN,
        )
        .unwrap();
        let wire = cmd.to_wire(TOKEN).to_string();
        let back = parse_command(&wire, TOKEN).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let raw = json!({"version": 1, "type": "health", "token": TOKEN, "payload": {}}).to_string();
        let err = parse_command(&raw, TOKEN).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolVersion);
        assert!(!err.retryable);
    }

    #[test]
    fn bad_token_is_auth_error() {
        let raw = json!({
            "version": PROTOCOL_VERSION,
            "type": "health",
            "token": "wrong",
            "payload": {}
        })
        .to_string();
        let err = parse_command(&raw, TOKEN).unwrap_err();
        assert_eq!(err.code, ErrorCode::Auth);
        assert!(!err.retryable);
    }

    #[test]
    fn send_media_requires_exactly_one_source() {
        let none = frame("send_media", json!({"to": "x@s.whatsapp.net"}));
        assert_eq!(parse_command(&none, TOKEN).unwrap_err().code, ErrorCode::Schema);

        let two = frame(
            "send_media",
            json!({"to": "x@s.whatsapp.net", "mediaUrl": "http://x", "mediaBase64": "aGk="}),
        );
        assert_eq!(parse_command(&two, TOKEN).unwrap_err().code, ErrorCode::Schema);

        let one = frame(
            "send_media",
            json!({"to": "x@s.whatsapp.net", "mediaUrl": "http://x"}),
        );
        assert!(parse_command(&one, TOKEN).is_ok());
    }

    #[test]
    fn poll_option_bounds() {
        let short = frame("send_poll", json!({"to": "x", "question": "q", "options": ["a"]}));
        assert_eq!(parse_command(&short, TOKEN).unwrap_err().code, ErrorCode::Schema);

        let ok = frame(
            "send_poll",
            json!({"to": "x", "question": "q", "options": ["a", "b"], "maxSelections": 1}),
        );
        assert!(parse_command(&ok, TOKEN).is_ok());
    }

    #[test]
    fn presence_composing_requires_chat() {
        let bad = frame("presence_update", json!({"state": "composing"}));
        assert_eq!(parse_command(&bad, TOKEN).unwrap_err().code, ErrorCode::Schema);

        let ok = frame("presence_update", json!({"state": "available"}));
        assert!(parse_command(&ok, TOKEN).is_ok());
    }

    #[test]
    fn unsupported_type() {
        let raw = frame("warp_drive", json!({}));
        assert_eq!(
            parse_command(&raw, TOKEN).unwrap_err().code,
            ErrorCode::Unsupported
        );
    }

    #[test]
    fn unknown_payload_keys_are_schema_errors() {
        let raw = frame("send_text", json!({"to": "x", "text": "hi", "bogus": 1}));
        assert_eq!(parse_command(&raw, TOKEN).unwrap_err().code, ErrorCode::Schema);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = "x".repeat(MAX_COMMAND_BYTES + 1);
        let err = parse_command(&big, TOKEN).unwrap_err();
        assert_eq!(err.code, ErrorCode::PayloadTooLarge);
    }

    #[test]
    fn error_messages_are_token_sanitized() {
        let err = ProtocolError::new(
            ErrorCode::Internal,
            format!("upstream rejected token {TOKEN} for account"),
            true,
            TOKEN,
        );
        assert!(!err.message.contains(TOKEN));
        assert!(err.message.contains("***"));
    }

    #[test]
    fn event_round_trips() {
        let event = Event::new("status", "acct-1", Some("r1".to_string()), json!({"status": "open"}));
        let raw = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn constant_time_compare_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
