//! # castline-core
//!
//! Streaming core for the castline live-video publisher.
//!
//! This crate contains:
//! - **Settings**: `Settings` snapshot, ingest URL parsing, stream-key sanitizing
//! - **Frame**: `FrameConditioner` turning raw capture frames into 16-aligned encoder samples
//! - **Encoder**: `EncoderSession` with backend fallback, warm-up and error-rate recovery
//! - **Quality**: `QualityController` for bounded bitrate / frame-rate adaptation
//! - **Telemetry**: transmission statistics, encoder health, host performance sampling
//! - **Connection**: the ingest state machine and its `ConnectionHandle` actor
//! - **Relay**: a framed TCP relay (`RelayServer` / `RelayClient`) for local testing
//! - **Streamer**: the `Streamer` facade tying it all together
//! - **Task**: `TaskSet` for named, cancellable background timers
//! - **Error**: `StreamError` and friends, `thiserror`-based and classified by `ErrorKind`

pub mod connection;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod quality;
pub mod relay;
pub mod settings;
pub mod streamer;
pub mod task;
pub mod telemetry;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use connection::{
    ClientFactory, ConnectionHandle, ConnectionState, ConnectionTuning, NullClient,
    ProtocolClient, SharedClientFactory, StreamStatus,
};
pub use encoder::{
    EncodedUnit, EncoderBackend, EncoderFactory, EncoderSelection, EncoderSession,
    SessionOptions, SoftwareFactory,
};
pub use error::{ConditionError, EncoderError, ErrorKind, StreamError};
pub use frame::{FrameConditioner, PixelFormat, RawFrame, SampleFormat};
pub use quality::{PerformanceIssue, QualityController, QualityThresholds};
pub use relay::{RelayClient, RelayConfig, RelayServer};
pub use settings::{IngestUrl, Settings};
pub use streamer::{SharedEncoderFactory, SharedProbeFactory, Streamer, StreamerOptions};
pub use task::TaskSet;
pub use telemetry::{
    ConnectionQuality, EncoderHealth, PerformanceProbe, PerformanceSample, StatsSnapshot,
    SystemProbe, ThermalLevel, TransmissionStats,
};
