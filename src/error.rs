//! Error types for the attache runtime

use thiserror::Error;

/// Result type alias for attache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the attache runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Policy document failed validation
    #[error("policy error: {0}")]
    Policy(String),

    /// Admin command error
    #[error("admin error: {0}")]
    Admin(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Bridge protocol error
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Responder (LLM) error
    #[error("responder error: {0}")]
    Responder(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Speech-to-text error
    #[error("ASR error: {0}")]
    Asr(String),

    /// Memory store error
    #[error("memory error: {0}")]
    Memory(String),

    /// Archive store error
    #[error("archive error: {0}")]
    Archive(String),

    /// Media handling error
    #[error("media error: {0}")]
    Media(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pipeline stage failure
    #[error("pipeline error in {stage}: {message}")]
    Pipeline {
        /// Stage that failed
        stage: &'static str,
        /// Failure description
        message: String,
    },
}

impl Error {
    /// Build a pipeline stage failure
    #[must_use]
    pub fn pipeline(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Pipeline {
            stage,
            message: message.into(),
        }
    }
}
