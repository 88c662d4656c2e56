//! Domain-specific error types for the streaming core.
//!
//! Every fallible operation returns a typed error. Per-frame failures
//! ([`ConditionError`], [`EncoderError::Frame`]) are recovered locally by
//! the frame thread; connection-level failures ([`StreamError`]) reach the
//! connection state machine and are classified with [`ErrorKind`].

use std::time::Duration;
use thiserror::Error;

use crate::encoder::{EncoderFault, RecoveryAction};
use crate::frame::{PixelFormat, SampleFormat};

// ── ErrorKind ────────────────────────────────────────────────────

/// Coarse classification surfaced to the status collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Missing or malformed URL / key. Fatal, never retried.
    Configuration,
    /// Stream key rejected after publish. Needs new credentials.
    Authentication,
    /// Timeout or unreachable server. Retried by the reconnect policy.
    Network,
    /// Encoder setup or runtime failure that exhausted local recovery.
    Encoder,
    /// Per-frame conditioning failure. Always skipped.
    Condition,
}

impl ErrorKind {
    /// Whether the reconnect policy may retry an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Authentication => write!(f, "authentication"),
            Self::Network => write!(f, "network"),
            Self::Encoder => write!(f, "encoder"),
            Self::Condition => write!(f, "condition"),
        }
    }
}

// ── StreamError ──────────────────────────────────────────────────

/// The canonical error type for the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Configuration Errors ─────────────────────────────────────
    /// The ingest URL is missing, malformed, or not an RTMP URL.
    #[error("invalid ingest url: {0}")]
    InvalidUrl(String),

    /// The stream key is empty after sanitizing.
    #[error("stream key is empty")]
    MissingStreamKey,

    /// A settings field is outside its accepted range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// `start` was called while a session is already running.
    #[error("session already active (state: {0})")]
    AlreadyActive(String),

    /// A state transition was attempted from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    // ── Authentication Errors ────────────────────────────────────
    /// The server accepted the handshake but refused the stream key.
    #[error("stream key rejected: {0}")]
    Authentication(String),

    // ── Network Errors ───────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The protocol client reported a transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The link is not established (no connection handle).
    #[error("not connected")]
    NotConnected,

    /// An mpsc / oneshot channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Relay Framing Errors ─────────────────────────────────────
    /// Received bytes that do not start with the relay magic.
    #[error("invalid magic bytes: expected CSL1")]
    InvalidMagic,

    /// The frame body failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Encoding or decoding of a message body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// Encoder failure that escaped local recovery.
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// Frame conditioning failure.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Classify this error for status reporting and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) | Self::MissingStreamKey | Self::InvalidSettings(_) => {
                ErrorKind::Configuration
            }
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Encoder(_) => ErrorKind::Encoder,
            Self::Condition(_) => ErrorKind::Condition,
            _ => ErrorKind::Network,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

// ── ConditionError ───────────────────────────────────────────────

/// Per-frame conditioning failure. The frame is skipped and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// Dimensions are zero or outside the supported range.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// The pixel buffer is smaller than `stride * height` requires.
    #[error("pixel buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// No conversion strategy exists for this input layout.
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    /// Every conversion strategy failed.
    #[error("pixel conversion failed: {0}")]
    ConversionFailed(String),

    /// The aspect-fill scaler could not produce the target frame.
    #[error("scaling failed: {0}")]
    ScalingFailed(String),
}

// ── EncoderError ─────────────────────────────────────────────────

/// Encoder session failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    /// `encode` was called before a successful `configure`.
    #[error("encoder session is not configured")]
    NotConfigured,

    /// Every backend selection strategy failed during setup.
    #[error("encoder setup failed after {attempts} attempts: {reason}")]
    SetupFailed { attempts: u32, reason: String },

    /// The backend refuses the sample format; the conditioner should
    /// fall back to another format and reconfigure.
    #[error("encoder does not accept {0:?} samples")]
    FormatUnsupported(SampleFormat),

    /// A single frame failed to encode. `action` says what the session
    /// already did (or wants the caller to do) about it.
    #[error("frame encode failed ({fault:?}, {action:?}): {message}")]
    Frame {
        fault: EncoderFault,
        action: RecoveryAction,
        message: String,
    },

    /// Recreation with the last-known-good configuration failed too.
    #[error("encoder failed permanently: {0}")]
    Fatal(String),
}

impl EncoderError {
    /// Whether the session can no longer encode without a quality
    /// downgrade or user intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::SetupFailed { .. })
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for StreamError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for StreamError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StreamError::Timeout(Duration::ZERO)
    }
}

impl From<Box<bincode::ErrorKind>> for StreamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StreamError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = StreamError::InvalidUrl("http://x".into());
        assert!(e.to_string().contains("http://x"));

        let e = StreamError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn classification() {
        assert_eq!(StreamError::MissingStreamKey.kind(), ErrorKind::Configuration);
        assert_eq!(
            StreamError::Authentication("bad key".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            StreamError::Timeout(Duration::from_secs(8)).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            StreamError::from(EncoderError::Fatal("gone".into())).kind(),
            ErrorKind::Encoder
        );
    }

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(StreamError::Network("reset".into()).is_retryable());
        assert!(!StreamError::Authentication("nope".into()).is_retryable());
        assert!(!StreamError::InvalidUrl(String::new()).is_retryable());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: StreamError = io_err.into();
        assert!(matches!(e, StreamError::Connection(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn fatal_encoder_errors() {
        assert!(EncoderError::Fatal("x".into()).is_fatal());
        assert!(!EncoderError::NotConfigured.is_fatal());
    }
}
