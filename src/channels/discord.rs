//! Discord channel adapter
//!
//! Outbound-capable adapter over the Discord REST API. Inbound flows
//! through a gateway process out of scope here; when enabled without
//! one, the channel simply never publishes inbound events.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;

use super::Channel;
use crate::Result;

const API_BASE: &str = "https://discord.com/api/v10";

/// Discord REST adapter
pub struct DiscordChannel {
    client: reqwest::Client,
    bot_token: String,
    api_base: String,
    connected: AtomicBool,
}

impl DiscordChannel {
    /// Create the adapter
    #[must_use]
    pub fn new(bot_token: String, api_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            api_base: api_url.unwrap_or_else(|| API_BASE.to_string()),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, chat_id: &str, text: &str, reply_to: Option<&str>) -> Result<()> {
        let mut body = json!({"content": text});
        if let Some(reply_to) = reply_to {
            body["message_reference"] = json!({"message_id": reply_to});
        }
        self.client
            .post(format!("{}/channels/{chat_id}/messages", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str, on: bool) -> Result<()> {
        if !on {
            return Ok(());
        }
        self.client
            .post(format!("{}/channels/{chat_id}/typing", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: &str,
        _participant: Option<&str>,
    ) -> Result<()> {
        let encoded: String = emoji
            .bytes()
            .map(|b| format!("%{b:02X}"))
            .collect();
        self.client
            .put(format!(
                "{}/channels/{chat_id}/messages/{message_id}/reactions/{encoded}/@me",
                self.api_base
            ))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
