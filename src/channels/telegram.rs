//! Telegram channel adapter
//!
//! Long-polls `getUpdates` and converts updates into canonical
//! messages. Outbound goes through `sendMessage` / `sendChatAction` /
//! `setMessageReaction`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use super::Channel;
use crate::bus::InboundBus;
use crate::message::{ContentBlock, ContentKind, Identity, Message};
use crate::{Error, Result};

/// Long-poll timeout in seconds
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram Bot API adapter
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    inbound: InboundBus,
    bot_username: tokio::sync::OnceCell<String>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    offset: Arc<AtomicI64>,
}

impl TelegramChannel {
    /// Create the adapter
    #[must_use]
    pub fn new(bot_token: &str, inbound: InboundBus) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            api_base: format!("https://api.telegram.org/bot{bot_token}"),
            inbound,
            bot_username: tokio::sync::OnceCell::new(),
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            offset: Arc::new(AtomicI64::new(0)),
        })
    }

    async fn api_call(&self, method: &str, body: Value) -> Result<Value> {
        let response: Value = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(Error::Channel(format!(
                "telegram {method} failed: {}",
                response.get("description").and_then(Value::as_str).unwrap_or("?")
            )));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn resolve_bot_username(&self) -> String {
        self.bot_username
            .get_or_init(|| async {
                match self.api_call("getMe", json!({})).await {
                    Ok(me) => me
                        .get("username")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_lowercase(),
                    Err(e) => {
                        tracing::warn!(error = %e, "getMe failed");
                        String::new()
                    }
                }
            })
            .await
            .clone()
    }

    async fn poll_once(&self) -> Result<()> {
        let offset = self.offset.load(Ordering::SeqCst);
        let updates = self
            .api_call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"],
                }),
            )
            .await?;

        let bot_username = self.resolve_bot_username().await;
        for update in updates.as_array().cloned().unwrap_or_default() {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                self.offset.store(update_id + 1, Ordering::SeqCst);
            }
            if let Some(message) = update.get("message") {
                if let Some(msg) = parse_update_message(message, &bot_username) {
                    self.inbound.publish(msg);
                }
            }
        }
        Ok(())
    }

    /// Start the polling loop
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            while self.running.load(Ordering::SeqCst) {
                if let Err(e) = self.poll_once().await {
                    tracing::warn!(error = %e, "telegram poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                }
            }
            self.connected.store(false, Ordering::SeqCst);
        })
    }
}

/// Convert one Bot API message object into a canonical [`Message`]
fn parse_update_message(message: &Value, bot_username: &str) -> Option<Message> {
    let message_id = message.get("message_id")?.as_i64()?.to_string();
    let chat = message.get("chat")?;
    let chat_id = chat.get("id")?.as_i64()?.to_string();
    let chat_type = chat.get("type").and_then(Value::as_str).unwrap_or("private");
    let from = message.get("from")?;
    let sender_id = from.get("id")?.as_i64()?.to_string();

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return None;
    }

    let mut sender = Identity::new(sender_id);
    sender.display_name = from
        .get("first_name")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    sender.handle = from
        .get("username")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let is_group = matches!(chat_type, "group" | "supergroup");
    let mentioned_bot = !bot_username.is_empty()
        && text.to_lowercase().contains(&format!("@{bot_username}"));

    let reply_to_bot = message
        .get("reply_to_message")
        .and_then(|r| r.get("from"))
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .is_some_and(|u| !bot_username.is_empty() && u.eq_ignore_ascii_case(bot_username));

    let reply_to = message.get("reply_to_message").map(|r| crate::message::ReplyRef {
        message_id: r
            .get("message_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_default(),
        text: r
            .get("text")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        sender: r
            .get("from")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string()),
    });

    let timestamp = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now);

    Some(Message {
        id: message_id,
        channel: "telegram".to_string(),
        chat_id,
        sender,
        content: vec![ContentBlock::text(text)],
        reply_to,
        timestamp,
        is_group,
        mentioned_bot,
        reply_to_bot,
        participant: None,
        metadata: serde_json::Map::new(),
    })
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn connect(&self) -> Result<()> {
        // Polling starts via spawn(); connect only verifies the token.
        self.api_call("getMe", json!({})).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, chat_id: &str, text: &str, reply_to: Option<&str>) -> Result<()> {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if let Some(reply_to) = reply_to.and_then(|r| r.parse::<i64>().ok()) {
            body["reply_parameters"] = json!({"message_id": reply_to});
        }
        self.api_call("sendMessage", body).await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str, on: bool) -> Result<()> {
        if !on {
            // The Bot API clears the action automatically.
            return Ok(());
        }
        self.api_call(
            "sendChatAction",
            json!({"chat_id": chat_id, "action": "typing"}),
        )
        .await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: &str,
        _participant: Option<&str>,
    ) -> Result<()> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| Error::Channel(format!("bad telegram message id: {message_id}")))?;
        self.api_call(
            "setMessageReaction",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "reaction": [{"type": "emoji", "emoji": emoji}],
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(chat_type: &str, text: &str) -> Value {
        json!({
            "message_id": 42,
            "date": 1_700_000_000,
            "chat": {"id": -100123, "type": chat_type},
            "from": {"id": 777, "first_name": "Ada", "username": "ada"},
            "text": text,
        })
    }

    #[test]
    fn group_update_parses() {
        let msg = parse_update_message(&update("supergroup", "hello @attache_bot"), "attache_bot")
            .unwrap();
        assert_eq!(msg.channel, "telegram");
        assert!(msg.is_group);
        assert!(msg.mentioned_bot);
        assert_eq!(msg.sender.handle.as_deref(), Some("ada"));
    }

    #[test]
    fn private_update_is_not_group() {
        let msg = parse_update_message(&update("private", "hi"), "attache_bot").unwrap();
        assert!(!msg.is_group);
        assert!(!msg.mentioned_bot);
    }

    #[test]
    fn reply_to_bot_detection() {
        let mut raw = update("supergroup", "yes");
        raw["reply_to_message"] = json!({
            "message_id": 41,
            "from": {"id": 1, "username": "Attache_Bot"},
            "text": "should I?",
        });
        let msg = parse_update_message(&raw, "attache_bot").unwrap();
        assert!(msg.reply_to_bot);
        assert_eq!(msg.reply_to.as_ref().unwrap().message_id, "41");
    }

    #[test]
    fn empty_text_is_skipped() {
        let mut raw = update("private", "");
        raw["text"] = json!("");
        assert!(parse_update_message(&raw, "b").is_none());
    }
}
