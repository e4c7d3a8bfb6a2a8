//! Magstream Core - Range-aware streaming transcode pipeline
//!
//! This crate resolves media addressed by a peer-to-peer content identifier,
//! probes its container metadata, maps HTTP byte ranges onto source time
//! ranges and drives an external transcoder whose fragmented MP4 output is
//! streamed live to HTTP clients.

pub mod config;
pub mod source;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::MagstreamConfig;
pub use source::{ContentEngine, EngineError, FileEntry, MediaSourceResolver};
pub use streaming::{MediaStreamer, StreamingError};

/// Core errors that can bubble up from any Magstream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MagstreamError {
    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MagstreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MagstreamError::Streaming(e) => match e {
                StreamingError::NotFound { identifier } => {
                    format!("Nothing found for {identifier}")
                }
                StreamingError::NoPlayableFile { identifier } => {
                    format!("No playable media file in {identifier}")
                }
                StreamingError::Timeout { operation, .. } => {
                    format!("Timed out during {operation}")
                }
                StreamingError::ProcessSpawnError { program, .. } => {
                    format!("Could not start {program}; is it installed?")
                }
                _ => "Streaming error occurred".to_string(),
            },
            MagstreamError::Engine(_) => "Content engine error occurred".to_string(),
            MagstreamError::Configuration { reason } => format!("Configuration error: {reason}"),
            MagstreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            MagstreamError::Configuration { .. } => true,
            MagstreamError::Streaming(e) => e.is_client_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MagstreamError>;
