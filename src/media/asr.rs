//! Speech-to-text transcription
//!
//! Voice notes are transcribed before policy evaluation so wake-phrase
//! matching and memory capture see text. The HTTP route speaks an
//! OpenAI-compatible `/audio/transcriptions` multipart shape.

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

/// Transcription backend seam
#[async_trait]
pub trait AsrTranscriber: Send + Sync {
    /// Transcribe audio bytes to text
    ///
    /// # Errors
    ///
    /// Returns error on provider failure
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// HTTP-backed transcriber
pub struct HttpAsr {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpAsr {
    /// Create a transcriber for the given endpoint
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
impl AsrTranscriber for HttpAsr {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", "whisper-1");

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response: TranscriptionResponse =
            request.send().await?.error_for_status()?.json().await?;
        Ok(response.text)
    }
}
