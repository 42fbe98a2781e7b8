use crate::config::ConfigError;
use crate::generation::ContentGenerationError;
use crate::stt::TranscriptionServiceError;
use crate::transport::{ProtocolError, TransportError};
use crate::tts::SynthesisServiceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transcription error: {0}")]
    Transcription(#[from] TranscriptionServiceError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisServiceError),

    #[error("Content generation error: {0}")]
    ContentGeneration(#[from] ContentGenerationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error must tear the session down.
    ///
    /// Only transport failures are session-fatal; everything else is handled
    /// per turn with a spoken or text fallback.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}
