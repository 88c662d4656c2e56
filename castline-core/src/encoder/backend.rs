//! Encoder backend seam.
//!
//! An [`EncoderFactory`] creates [`EncoderBackend`]s for a given
//! [`EncoderConfig`] and [`EncoderSelection`] tier. Hardware encoders
//! live behind this trait; the crate ships a software backend in
//! [`crate::encoder::software`].

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{EncoderSample, SampleFormat};
use crate::settings::Settings;

// ── Fault classification ─────────────────────────────────────────

/// Why a backend call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderFault {
    /// The backend session is gone (device reset, driver restart).
    SessionInvalidated,
    /// The backend could not allocate buffers.
    AllocationFailed,
    /// The backend rejects the sample pixel format.
    FormatUnsupported,
    /// No backend matching the selection tier exists.
    Unavailable,
    /// Anything else.
    Unknown,
}

/// What was done about a failed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// Counted toward the error rate; nothing else.
    Skip,
    /// Backend caches dropped; the caller should shrink its pools too.
    RelieveMemory,
    /// The caller should disable the sample format and reconfigure.
    FallbackFormat,
    /// The session was rebuilt from the last-known-good configuration.
    Recreated,
}

/// Error reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{fault:?}: {message}")]
pub struct BackendError {
    pub fault: EncoderFault,
    pub message: String,
}

impl BackendError {
    pub fn new(fault: EncoderFault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }
}

// ── Selection tiers ──────────────────────────────────────────────

/// How strictly a hardware encoder is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderSelection {
    RequireHardware,
    PreferHardware,
    SoftwareOnly,
}

impl EncoderSelection {
    /// Setup fallback chain, strictest first.
    pub const CHAIN: [EncoderSelection; 3] = [
        EncoderSelection::RequireHardware,
        EncoderSelection::PreferHardware,
        EncoderSelection::SoftwareOnly,
    ];

    /// The chain starting at `self`.
    pub fn chain_from(self) -> impl Iterator<Item = EncoderSelection> {
        Self::CHAIN.into_iter().skip_while(move |s| *s != self)
    }
}

// ── Configuration ────────────────────────────────────────────────

/// H.264-style profile hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    Baseline,
    Main,
    High,
}

/// Everything a backend needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub format: SampleFormat,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub frame_rate: u32,
    /// Frames between forced key frames.
    pub keyframe_interval: u32,
    /// Ask the backend for real-time (low-latency) priority.
    pub realtime: bool,
    pub profile: Profile,
    /// Level times ten, e.g. `31` for 3.1.
    pub level: u8,
}

/// (max macroblocks per second, level) pairs.
const LEVEL_LIMITS: [(u64, u8); 8] = [
    (40_500, 30),
    (108_000, 31),
    (216_000, 32),
    (245_760, 41),
    (522_240, 42),
    (589_824, 50),
    (983_040, 51),
    (2_073_600, 52),
];

impl EncoderConfig {
    /// Derive a configuration from a settings snapshot.
    pub fn from_settings(settings: &Settings, format: SampleFormat, keyframe_secs: u32) -> Self {
        let (width, height) = settings.target_dimensions();
        let frame_rate = settings.frame_rate.max(1);
        Self {
            format,
            width,
            height,
            bitrate_kbps: settings.video_bitrate_kbps,
            frame_rate,
            keyframe_interval: frame_rate * keyframe_secs.max(1),
            realtime: true,
            profile: Self::profile_for(height),
            level: Self::level_for(width, height, frame_rate),
        }
    }

    fn profile_for(height: u32) -> Profile {
        match height {
            0..=480 => Profile::Baseline,
            481..=720 => Profile::Main,
            _ => Profile::High,
        }
    }

    fn level_for(width: u32, height: u32, frame_rate: u32) -> u8 {
        let mbps = (width as u64 / 16) * (height as u64 / 16) * frame_rate as u64;
        LEVEL_LIMITS
            .iter()
            .find(|(limit, _)| mbps <= *limit)
            .map_or(52, |(_, level)| *level)
    }

    /// Whether `other` differs only in bitrate / frame rate.
    pub fn rate_only_change(&self, other: &EncoderConfig) -> bool {
        self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && (self.bitrate_kbps != other.bitrate_kbps || self.frame_rate != other.frame_rate)
    }

    /// Byte budget per frame at the configured bitrate.
    pub fn frame_budget(&self) -> usize {
        (self.bitrate_kbps as usize * 1000 / 8) / self.frame_rate.max(1) as usize
    }
}

// ── Output ───────────────────────────────────────────────────────

/// One compressed access unit, ready for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedUnit {
    pub frame_number: u64,
    pub pts: Duration,
    pub duration: Duration,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

// ── Traits ───────────────────────────────────────────────────────

/// A live encoder instance.
pub trait EncoderBackend: Send {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    fn is_hardware(&self) -> bool;

    /// Compress one sample.
    fn encode(&mut self, sample: &EncoderSample, keyframe: bool)
    -> Result<EncodedUnit, BackendError>;

    /// Apply a new bitrate / frame rate in place. Returns `false` when
    /// the backend needs to be recreated instead.
    fn update_rate(&mut self, _bitrate_kbps: u32, _frame_rate: u32) -> bool {
        false
    }

    /// Drop internal caches after an allocation failure.
    fn relieve_memory(&mut self) {}

    /// Release backend resources.
    fn close(&mut self) {}
}

/// Creates backends for a selection tier.
pub trait EncoderFactory: Send {
    fn create(
        &self,
        config: &EncoderConfig,
        selection: EncoderSelection,
    ) -> Result<Box<dyn EncoderBackend>, BackendError>;
}

// ── Tests ────────────────────────────────────────────────────────
