//! Messaging channel adapters
//!
//! Each platform implements the `Channel` trait. Adapters convert
//! platform events into canonical [`Message`]s published on the inbound
//! bus; the [`ChannelManager`] dispatches outbound intents back through
//! the owning adapter.

mod discord;
mod feishu;
mod telegram;
mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{BusReceiver, OutboundItem};
use crate::intents::{OrchestratorIntent, TypingState};
use crate::Result;

pub use discord::DiscordChannel;
pub use feishu::FeishuChannel;
pub use telegram::TelegramChannel;
pub use whatsapp::{markdown_to_whatsapp, WhatsAppChannel};

/// Trait for messaging channel adapters
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel tag ("whatsapp", "telegram", ...)
    fn name(&self) -> &'static str;

    /// Connect and start feeding the inbound bus
    async fn connect(&self) -> Result<()>;

    /// Disconnect and stop background work
    async fn disconnect(&self) -> Result<()>;

    /// Whether the adapter currently holds a live connection
    fn is_connected(&self) -> bool;

    /// Send a text message
    async fn send_text(&self, chat_id: &str, text: &str, reply_to: Option<&str>) -> Result<()>;

    /// Send a media message
    ///
    /// Default implementation reports the channel as text-only.
    async fn send_media(
        &self,
        _chat_id: &str,
        _path: &str,
        _mime_type: Option<&str>,
        _caption: Option<&str>,
        _reply_to: Option<&str>,
    ) -> Result<()> {
        Err(crate::Error::Channel(format!(
            "{} does not support media send",
            self.name()
        )))
    }

    /// Toggle the typing indicator (no-op where unsupported)
    async fn send_typing(&self, _chat_id: &str, _on: bool) -> Result<()> {
        Ok(())
    }

    /// React to a message (no-op where unsupported)
    async fn add_reaction(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _emoji: &str,
        _participant: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Registry and outbound dispatcher for channel adapters
pub struct ChannelManager {
    channels: HashMap<&'static str, Arc<dyn Channel>>,
}

impl ChannelManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel adapter
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name(), channel);
    }

    /// Look up a registered adapter
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    /// Connect all registered channels
    ///
    /// # Errors
    ///
    /// Returns the first connect failure
    pub async fn connect_all(&self) -> Result<()> {
        for channel in self.channels.values() {
            tracing::info!(channel = channel.name(), "connecting channel");
            channel.connect().await?;
        }
        Ok(())
    }

    /// Disconnect all channels, logging failures
    pub async fn disconnect_all(&self) {
        for channel in self.channels.values() {
            if let Err(e) = channel.disconnect().await {
                tracing::warn!(channel = channel.name(), error = %e, "disconnect failed");
            }
        }
    }

    /// Dispatch one outbound item to its owning adapter
    pub async fn dispatch(&self, item: OutboundItem) {
        let Some(channel) = self.channels.get(item.channel.as_str()) else {
            tracing::warn!(channel = %item.channel, "outbound intent for unknown channel");
            return;
        };

        let result = match &item.intent {
            OrchestratorIntent::OutboundText {
                chat_id,
                text,
                reply_to,
                ..
            } => channel.send_text(chat_id, text, reply_to.as_deref()).await,
            OrchestratorIntent::OutboundMedia {
                chat_id,
                path,
                mime_type,
                caption,
                reply_to,
                ..
            } => {
                channel
                    .send_media(
                        chat_id,
                        path,
                        mime_type.as_deref(),
                        caption.as_deref(),
                        reply_to.as_deref(),
                    )
                    .await
            }
            OrchestratorIntent::Reaction {
                chat_id,
                message_id,
                emoji,
                participant,
                ..
            } => {
                channel
                    .add_reaction(chat_id, message_id, emoji, participant.as_deref())
                    .await
            }
            OrchestratorIntent::Typing { chat_id, state, .. } => {
                channel
                    .send_typing(chat_id, *state == TypingState::On)
                    .await
            }
            OrchestratorIntent::MemoryCapture { .. } | OrchestratorIntent::MetricEvent { .. } => {
                return;
            }
        };

        if let Err(e) = result {
            tracing::warn!(channel = channel.name(), error = %e, "outbound dispatch failed");
        }
    }

    /// Consume the outbound bus until it closes
    pub async fn run(self: Arc<Self>, mut rx: BusReceiver<OutboundItem>) {
        loop {
            let item = rx.recv().await;
            self.dispatch(item).await;
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}
