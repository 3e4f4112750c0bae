//! Text-to-speech synthesis
//!
//! Voice replies strip markdown, truncate to the chat's sentence/char
//! budget, and synthesize over an HTTP route. Failures and oversized
//! audio fall back to text upstream.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::Result;

/// Synthesis backend seam
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    /// Produce audio bytes (ogg/opus) for the given text
    ///
    /// # Errors
    ///
    /// Returns error on provider failure
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static EMPHASIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*_~]{1,2}([^*_~]+)[*_~]{1,2}").unwrap());
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());

/// Strip markdown decorations that read badly as speech
#[must_use]
pub fn strip_markdown_for_tts(text: &str) -> String {
    let text = CODE_BLOCK_RE.replace_all(text, "");
    let text = INLINE_CODE_RE.replace_all(&text, "$1");
    let text = EMPHASIS_RE.replace_all(&text, "$1");
    let text = HEADING_RE.replace_all(&text, "");
    let text = LINK_RE.replace_all(&text, "$1");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate text to at most `max_sentences` sentences and `max_chars`
/// characters, cutting on sentence boundaries where possible
#[must_use]
pub fn truncate_for_voice(text: &str, max_sentences: usize, max_chars: usize) -> String {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            sentences.push(std::mem::take(&mut current));
            if sentences.len() >= max_sentences.max(1) {
                break;
            }
        }
    }
    if sentences.len() < max_sentences.max(1) && !current.trim().is_empty() {
        sentences.push(current);
    }

    let joined = sentences.join("").trim().to_string();
    if joined.chars().count() <= max_chars.max(1) {
        return joined;
    }
    let mut truncated: String = joined.chars().take(max_chars.max(1)).collect();
    if let Some(cut) = truncated.rfind(' ') {
        truncated.truncate(cut);
    }
    truncated
}

/// HTTP-backed synthesizer (OpenAI-compatible `/audio/speech` shape)
pub struct HttpTts {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTts {
    /// Create a synthesizer for the given endpoint
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl TtsSynthesizer for HttpTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "input": text,
            "voice": voice,
            "response_format": "opus",
        }));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let bytes = request.send().await?.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_is_stripped() {
        let plain = strip_markdown_for_tts("**Hello** `world`, see [docs](https://x.test)!");
        assert_eq!(plain, "Hello world, see docs!");
    }

    #[test]
    fn code_blocks_vanish() {
        let plain = strip_markdown_for_tts("before\n```rust\nfn x() {}\n```\nafter");
        assert_eq!(plain, "before after");
    }

    #[test]
    fn truncation_respects_sentence_budget() {
        let text = "One. Two. Three. Four.";
        assert_eq!(truncate_for_voice(text, 2, 500), "One. Two.");
    }

    #[test]
    fn truncation_respects_char_budget() {
        let text = "A rather long sentence that keeps going and going without a period";
        let out = truncate_for_voice(text, 2, 20);
        assert!(out.chars().count() <= 20);
        assert!(!out.is_empty());
    }
}
