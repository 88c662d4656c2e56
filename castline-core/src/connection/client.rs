//! The seam between the connection manager and a wire protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::encoder::EncodedUnit;
use crate::error::StreamError;
use crate::settings::IngestUrl;

/// One protocol connection plus its publish stream.
///
/// Timeouts are applied by the caller. An explicit key rejection from
/// `publish` should be reported as [`StreamError::Authentication`].
#[async_trait]
pub trait ProtocolClient: Send {
    async fn connect(&mut self, url: &IngestUrl) -> Result<(), StreamError>;

    async fn publish(&mut self, stream_key: &str) -> Result<(), StreamError>;

    /// Whether the link is still usable.
    async fn is_alive(&mut self) -> bool;

    async fn send(&mut self, unit: &EncodedUnit) -> Result<(), StreamError>;

    async fn close_publish(&mut self) -> Result<(), StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;

    /// Measure one round trip. `None` when the protocol has no probe.
    async fn round_trip(&mut self) -> Option<Result<Duration, StreamError>> {
        None
    }
}

/// Creates a fresh client for every connection attempt.
pub trait ClientFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn ProtocolClient>;
}

impl<F> ClientFactory for F
where
    F: Fn() -> Box<dyn ProtocolClient> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn ProtocolClient> {
        self()
    }
}

pub type SharedClientFactory = Arc<dyn ClientFactory>;

// ── NullClient ───────────────────────────────────────────────────

/// Accepts everything and discards media. Used for dry runs.
#[derive(Debug, Default)]
pub struct NullClient {
    connected: bool,
    published: bool,
    units: u64,
}

impl NullClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units discarded so far.
    pub fn units(&self) -> u64 {
        self.units
    }
}

#[async_trait]
impl ProtocolClient for NullClient {
    async fn connect(&mut self, url: &IngestUrl) -> Result<(), StreamError> {
        trace!(%url, "null client connected");
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, _stream_key: &str) -> Result<(), StreamError> {
        if !self.connected {
            return Err(StreamError::NotConnected);
        }
        self.published = true;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        self.connected
    }

    async fn send(&mut self, _unit: &EncodedUnit) -> Result<(), StreamError> {
        if !self.published {
            return Err(StreamError::NotConnected);
        }
        self.units += 1;
        Ok(())
    }

    async fn close_publish(&mut self) -> Result<(), StreamError> {
        self.published = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.published = false;
        self.connected = false;
        Ok(())
    }

    async fn round_trip(&mut self) -> Option<Result<Duration, StreamError>> {
        Some(Ok(Duration::ZERO))
    }
}
