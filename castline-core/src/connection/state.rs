//! Connection state machine and the status value published to observers.
//!
//! ```text
//!  Idle ──► Connecting ──► Connected ──► Streaming ──► Disconnecting ──► Idle
//!   ▲           │              │             │
//!   │           ▼              ▼             ▼
//!   └────────────────────── Error ◄──────────┘
//! ```
//!
//! Transitions are validated and return `Result` instead of panicking.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StreamError};
use crate::telemetry::{EncoderHealthSnapshot, StatsSnapshot};

// ── ConnectionState ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session. Initial state.
    #[default]
    Idle,

    /// Opening the protocol connection.
    Connecting,

    /// Connection is up; publish in progress.
    Connected,

    /// Publish accepted and verified; media flows.
    Streaming,

    /// Closing publish and connection.
    Disconnecting,

    /// The session failed. `terminal` means no reconnect is pending and
    /// only an explicit start recovers.
    Error { kind: ErrorKind, terminal: bool },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Error { kind, terminal: true } => write!(f, "Error({kind}, terminal)"),
            Self::Error { kind, .. } => write!(f, "Error({kind})"),
        }
    }
}

impl ConnectionState {
    /// States in which the connection handle exists.
    pub fn has_handle(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming | Self::Disconnecting)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether `start` is accepted from here.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Error { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`, `Error` (explicit start or reconnect).
    pub fn begin_connect(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Idle | Self::Error { .. } => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot connect: not in Idle or Error state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn connected(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot mark connected: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connected`.
    pub fn begin_streaming(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Connected => {
                *self = Self::Streaming;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot stream: not in Connected state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Connected`, `Streaming`.
    pub fn fail(&mut self, kind: ErrorKind, terminal: bool) -> Result<(), StreamError> {
        match self {
            Self::Connecting | Self::Connected | Self::Streaming => {
                *self = Self::Error { kind, terminal };
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot fail: no connection attempt or session in progress",
            )),
        }
    }

    /// Mark a pending `Error` as terminal (reconnects exhausted).
    pub fn make_terminal(&mut self) {
        if let Self::Error { terminal, .. } = self {
            *terminal = true;
        }
    }

    /// Valid from: `Connected`, `Streaming`.
    pub fn begin_disconnect(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Connected | Self::Streaming => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot disconnect: no open connection",
            )),
        }
    }

    /// Valid from: `Disconnecting`, `Connecting`, `Error`.
    pub fn finish_disconnect(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Disconnecting | Self::Connecting | Self::Error { .. } => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot finish disconnect: not in a disconnectable state",
            )),
        }
    }
}

// ── StreamStatus ─────────────────────────────────────────────────

/// What observers see: state, a human-readable message and counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    pub state: ConnectionState,
    pub message: String,
    pub stats: StatsSnapshot,
    pub encoder: EncoderHealthSnapshot,
    /// Reconnect attempt in progress or scheduled, 0 when none.
    pub reconnect_attempt: u32,
    /// Times the health monitor declared the link lost this session.
    pub connection_losses: u32,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = ConnectionState::default();
        assert!(state.is_idle());

        state.begin_connect().unwrap();
        assert_eq!(state, ConnectionState::Connecting);
        assert!(!state.has_handle());

        state.connected().unwrap();
        assert!(state.has_handle());

        state.begin_streaming().unwrap();
        assert!(state.is_streaming());

        state.begin_disconnect().unwrap();
        assert_eq!(state, ConnectionState::Disconnecting);
        assert!(state.has_handle());

        state.finish_disconnect().unwrap();
        assert!(state.is_idle());
    }

    #[test]
    fn error_reachable_from_active_states_only() {
        for mut state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Streaming,
        ] {
            state.fail(ErrorKind::Network, false).unwrap();
            assert_eq!(state.error_kind(), Some(ErrorKind::Network));
            assert!(!state.has_handle());
        }
        let mut idle = ConnectionState::Idle;
        assert!(idle.fail(ErrorKind::Network, false).is_err());
        let mut closing = ConnectionState::Disconnecting;
        assert!(closing.fail(ErrorKind::Network, false).is_err());
    }

    #[test]
    fn start_allowed_from_idle_and_error() {
        let mut state = ConnectionState::Error {
            kind: ErrorKind::Authentication,
            terminal: true,
        };
        assert!(state.can_start());
        state.begin_connect().unwrap();
        assert!(!state.can_start());
        assert!(state.begin_connect().is_err());
    }

    #[test]
    fn invalid_transitions() {
        assert!(ConnectionState::Idle.begin_streaming().is_err());
        assert!(ConnectionState::Idle.connected().is_err());
        assert!(ConnectionState::Idle.begin_disconnect().is_err());
        assert!(ConnectionState::Streaming.finish_disconnect().is_err());
        assert!(ConnectionState::Connecting.begin_streaming().is_err());
    }

    #[test]
    fn make_terminal_only_touches_errors() {
        let mut state = ConnectionState::Error {
            kind: ErrorKind::Network,
            terminal: false,
        };
        state.make_terminal();
        assert_eq!(
            state,
            ConnectionState::Error {
                kind: ErrorKind::Network,
                terminal: true
            }
        );
        let mut idle = ConnectionState::Idle;
        idle.make_terminal();
        assert!(idle.is_idle());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionState::Streaming.to_string(), "Streaming");
        assert_eq!(
            ConnectionState::Error {
                kind: ErrorKind::Network,
                terminal: true
            }
            .to_string(),
            "Error(network, terminal)"
        );
    }
}
