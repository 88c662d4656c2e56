//! Messages for the connection actor.
//!
//! Requests that need an answer carry a `oneshot` `respond_to`. Timer
//! ticks come from the actor's own background tasks.

use tokio::sync::oneshot;

use crate::encoder::EncodedUnit;
use crate::error::StreamError;
use crate::settings::Settings;

#[derive(Debug)]
pub enum ConnectionMessage {
    /// Open a session with `settings`.
    Start {
        settings: Settings,
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },

    /// Close the session. A no-op when idle.
    Stop {
        respond_to: oneshot::Sender<()>,
    },

    /// Send one encoded unit on the publish stream.
    Publish { unit: EncodedUnit },

    /// The frame pipeline failed beyond local recovery.
    PipelineFailed { error: StreamError },

    /// Health-check timer fired.
    HealthTick,

    /// Statistics timer fired.
    StatsTick,

    /// Reconnect backoff elapsed. Ignored when `generation` is stale.
    Reconnect { generation: u64 },
}
