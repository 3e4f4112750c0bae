//! Responder contract and LLM-backed implementation
//!
//! The responder is an external collaborator: given the enriched event,
//! the policy decision, and recalled memory snippets, it produces a
//! reply (or nothing). The HTTP implementation speaks an
//! OpenAI-compatible chat completions route.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::ResponderConfig;
use crate::message::Message;
use crate::pipeline::reply_context::{AMBIENT_WINDOW_KEY, REPLY_WINDOW_KEY};
use crate::policy::PolicyDecision;
use crate::{Error, Result};

/// External reply generator
#[async_trait]
pub trait Responder: Send + Sync {
    /// Produce a reply for one event; `None` means stay silent
    ///
    /// # Errors
    ///
    /// Returns error on provider failure (the pipeline converts it into
    /// an apology + failure reaction)
    async fn generate_reply(
        &self,
        event: &Message,
        decision: &PolicyDecision,
        memory_context: &str,
    ) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI-compatible HTTP responder
pub struct HttpResponder {
    client: reqwest::Client,
    config: ResponderConfig,
}

impl HttpResponder {
    /// Create a responder from config
    #[must_use]
    pub fn new(config: ResponderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_prompt(event: &Message, memory_context: &str) -> String {
        let mut prompt = String::new();

        if let Some(window) = event.metadata.get(REPLY_WINDOW_KEY).and_then(|v| v.as_array()) {
            prompt.push_str("Reply thread (most recent first):\n");
            for line in window {
                let sender = line["sender"].as_str().unwrap_or("unknown");
                let text = line["text"].as_str().unwrap_or("");
                prompt.push_str(&format!("  [{sender}] {text}\n"));
            }
            prompt.push('\n');
        }
        if let Some(window) = event.metadata.get(AMBIENT_WINDOW_KEY).and_then(|v| v.as_array()) {
            prompt.push_str("Recent conversation:\n");
            for line in window {
                let sender = line["sender"].as_str().unwrap_or("unknown");
                let text = line["text"].as_str().unwrap_or("");
                prompt.push_str(&format!("  [{sender}] {text}\n"));
            }
            prompt.push('\n');
        }
        if !memory_context.is_empty() {
            prompt.push_str(memory_context);
            prompt.push('\n');
        }

        let text = event
            .metadata_str(crate::pipeline::security_input::SANITIZED_TEXT_KEY)
            .map_or_else(|| event.text_content(), ToString::to_string);
        prompt.push_str(&format!("{}: {text}", event.sender.display()));
        prompt
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn generate_reply(
        &self,
        event: &Message,
        decision: &PolicyDecision,
        memory_context: &str,
    ) -> Result<Option<String>> {
        let Some(ref api_url) = self.config.api_url else {
            return Err(Error::Responder("no responder route configured".to_string()));
        };

        let mut messages = Vec::new();
        if let Some(ref persona) = decision.persona_file {
            if let Ok(persona_text) = std::fs::read_to_string(persona) {
                messages.push(json!({"role": "system", "content": persona_text}));
            }
        }
        messages.push(json!({
            "role": "user",
            "content": Self::build_prompt(event, memory_context),
        }));

        let mut request = self
            .client
            .post(format!("{}/chat/completions", api_url.trim_end_matches('/')))
            .json(&json!({
                "model": self.config.model,
                "messages": messages,
            }));
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response: ChatCompletionResponse =
            request.send().await?.error_for_status()?.json().await?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(reply)
    }
}

/// Tracks responder failures per chat; repeated failures within a short
/// window suppress output for a cooldown
pub struct FailureTracker {
    window: Duration,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<HashMap<String, ChatFailures>>,
}

#[derive(Default)]
struct ChatFailures {
    failures: Vec<Instant>,
    suppressed_until: Option<Instant>,
}

impl FailureTracker {
    /// Create a tracker from config
    #[must_use]
    pub fn new(config: &ResponderConfig) -> Self {
        Self {
            window: Duration::from_secs(config.failure_window_seconds),
            threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.failure_cooldown_seconds),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Whether replies for this chat are currently suppressed
    #[must_use]
    pub fn is_suppressed(&self, chat_key: &str) -> bool {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .get(chat_key)
            .and_then(|c| c.suppressed_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Record a failure; returns true when the chat just entered
    /// suppression
    pub fn record_failure(&self, chat_key: &str) -> bool {
        let now = Instant::now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let chat = state.entry(chat_key.to_string()).or_default();
        chat.failures.retain(|t| now.duration_since(*t) < self.window);
        chat.failures.push(now);
        if chat.failures.len() >= self.threshold as usize && chat.suppressed_until.is_none() {
            chat.suppressed_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    /// Record a success, clearing failure state
    pub fn record_success(&self, chat_key: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.remove(chat_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Identity;

    fn tracker() -> FailureTracker {
        FailureTracker::new(&ResponderConfig {
            failure_window_seconds: 60,
            failure_threshold: 3,
            failure_cooldown_seconds: 300,
            ..ResponderConfig::default()
        })
    }

    #[test]
    fn suppression_kicks_in_after_threshold() {
        let t = tracker();
        assert!(!t.record_failure("c1"));
        assert!(!t.record_failure("c1"));
        assert!(t.record_failure("c1"));
        assert!(t.is_suppressed("c1"));
        assert!(!t.is_suppressed("c2"));
    }

    #[test]
    fn success_clears_failures() {
        let t = tracker();
        t.record_failure("c1");
        t.record_failure("c1");
        t.record_success("c1");
        assert!(!t.record_failure("c1"));
    }

    #[test]
    fn prompt_includes_context_windows() {
        let mut event = Message::text("whatsapp", "c1", "m1", Identity::new("u1"), "what now?");
        event.metadata.insert(
            AMBIENT_WINDOW_KEY.to_string(),
            serde_json::json!([{"sender": "alice", "text": "we moved the meeting", "timestamp": "2026-01-01T00:00:00Z"}]),
        );
        let prompt = HttpResponder::build_prompt(&event, "Relevant memories:\n- [preference] short answers\n");
        assert!(prompt.contains("we moved the meeting"));
        assert!(prompt.contains("short answers"));
        assert!(prompt.contains("what now?"));
    }
}
