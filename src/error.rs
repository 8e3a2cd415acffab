//! # Error Handling
//!
//! This module defines the error type shared by every layer of the bridge:
//! the relay connection, the audio session, the pacer and the upstream
//! orchestrator.
//!
//! ## Error Categories:
//! - **Transport failures**: the frontend reported a fatal `error`, or the
//!   host's evaluate primitive itself failed. Terminal, never retried.
//! - **Device activation failures**: the frontend could not open its
//!   recording/playback device. Surfaced only through `await_start`.
//! - **Audio misuse**: mismatched configurations or malformed audio data.
//! - **Upstream failures**: the remote live API connection broke.
//! - **Configuration problems**: invalid settings in `config.toml` or the
//!   environment.
//!
//! ## Usage Example:
//! ```rust
//! use live_audio_bridge::error::{BridgeError, BridgeResult};
//!
//! fn check(len: usize) -> BridgeResult<()> {
//!     if len % 2 != 0 {
//!         return Err(BridgeError::InvalidAudio("odd byte count".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Errors produced by the bridge.
///
/// ## Rust Concepts:
/// - **thiserror**: `#[derive(Error)]` writes the `Display` and
///   `std::error::Error` impls from the `#[error(...)]` attributes
/// - **#[from]**: generates a `From` impl so `?` converts foreign errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The frontend reported a fatal relay-level error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The host's synchronous evaluate-in-frontend call failed.
    #[error("Frontend evaluation failed: {0}")]
    Frontend(String),

    /// The relay (or the session built on it) reached normal completion.
    #[error("Relay connection closed")]
    Closed,

    /// The frontend could not activate its audio device.
    #[error("Failed to start audio: {0}")]
    FailedToStart(String),

    /// Two audio buffers with different configurations were combined.
    #[error("Audio configuration mismatch: {left} vs {right}")]
    ConfigMismatch { left: String, right: String },

    /// Audio bytes or a WAV container could not be interpreted.
    #[error("Invalid audio data: {0}")]
    InvalidAudio(String),

    /// The upstream live API connection failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The upstream live API closed the connection.
    #[error("Upstream connection closed")]
    UpstreamClosed,

    /// A supervised task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),

    /// Configuration file or environment variable problems.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a new upstream error.
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create a new frontend evaluation error.
    pub fn frontend<S: Into<String>>(msg: S) -> Self {
        Self::Frontend(msg.into())
    }

    /// True for the two normal-termination variants.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::UpstreamClosed)
    }
}

/// Configuration loading can fail for various reasons (missing files,
/// invalid syntax, wrong types). These are reported as configuration errors.
impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        match err {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => BridgeError::UpstreamClosed,
            other => BridgeError::Upstream(other.to_string()),
        }
    }
}

/// Type alias for Results that use the bridge error type.
///
/// Write `BridgeResult<Bytes>` instead of `Result<Bytes, BridgeError>`.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::FailedToStart("NotAllowedError: Permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to start audio: NotAllowedError: Permission denied"
        );

        let err = BridgeError::Remote("end of input".to_string());
        assert_eq!(err.to_string(), "Remote error: end of input");
    }

    #[test]
    fn test_closed_variants() {
        assert!(BridgeError::Closed.is_closed());
        assert!(BridgeError::UpstreamClosed.is_closed());
        assert!(!BridgeError::upstream("reset").is_closed());
    }

    #[test]
    fn test_json_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: BridgeError = parse.unwrap_err().into();
        assert!(matches!(err, BridgeError::Json(_)));
    }
}
