//! Configuration for the castline publisher.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use castline_core::{
    ConnectionTuning, EncoderSelection, PixelFormat, QualityThresholds, SessionOptions, Settings,
    StreamerOptions,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastlineConfig {
    /// The stream itself: ingest URL, key, resolution, rates.
    pub stream: Settings,
    /// Timeouts, health checks and reconnect backoff.
    pub connection: ConnectionConfig,
    /// Encoder session tuning.
    pub encoder: EncoderSection,
    /// Adaptive quality.
    pub adaptive: AdaptiveConfig,
    /// Synthetic test-pattern source.
    pub source: SourceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Connection timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub publish_timeout_secs: u64,
    /// Wait after publish acceptance before re-checking the link.
    pub publish_verify_delay_ms: u64,
    pub health_check_interval_secs: u64,
    /// Consecutive failed health checks before the link counts as lost.
    pub max_connection_failures: u32,
    pub reconnect_base_delay_secs: u64,
    pub reconnect_step_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub stats_interval_secs: u64,
}

/// Encoder session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    /// Where the backend fallback chain starts: "require_hardware",
    /// "prefer_hardware" or "software_only".
    pub selection: EncoderSelection,
    /// Solid frames pushed through a new encoder before real ones.
    pub warmup_frames: u32,
    pub keyframe_secs: u32,
    /// Rolling error rate that triggers encoder recreation.
    pub max_error_rate: f64,
}

/// Adaptive quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Seconds between quality evaluations.
    pub interval_secs: u64,
    /// Seconds between host performance samples.
    pub sample_interval_secs: u64,
    pub thresholds: QualityThresholds,
}

/// Test-pattern source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Pixel layout the source produces.
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ConnectionConfig {
    fn default() -> Self {
        let t = ConnectionTuning::default();
        Self {
            publish_timeout_secs: t.publish_timeout.as_secs(),
            publish_verify_delay_ms: t.publish_verify_delay.as_millis() as u64,
            health_check_interval_secs: t.health_check_interval.as_secs(),
            max_connection_failures: t.max_connection_failures,
            reconnect_base_delay_secs: t.reconnect_base_delay.as_secs(),
            reconnect_step_secs: t.reconnect_step.as_secs(),
            max_reconnect_delay_secs: t.max_reconnect_delay.as_secs(),
            max_reconnect_attempts: t.max_reconnect_attempts,
            stats_interval_secs: t.stats_interval.as_secs(),
        }
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        let s = SessionOptions::default();
        Self {
            selection: s.selection,
            warmup_frames: s.warmup_frames,
            keyframe_secs: s.keyframe_secs,
            max_error_rate: s.max_error_rate,
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
            sample_interval_secs: 2,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Bgra8,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CastlineConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// The default configuration as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Streamer options for this configuration. Zero intervals are
    /// raised to one unit.
    pub fn streamer_options(&self) -> StreamerOptions {
        let c = &self.connection;
        let defaults = ConnectionTuning::default();
        let tuning = ConnectionTuning {
            publish_timeout: secs(c.publish_timeout_secs),
            publish_verify_delay: Duration::from_millis(c.publish_verify_delay_ms),
            health_check_interval: secs(c.health_check_interval_secs),
            max_connection_failures: c.max_connection_failures.max(1),
            reconnect_base_delay: Duration::from_secs(c.reconnect_base_delay_secs),
            reconnect_step: Duration::from_secs(c.reconnect_step_secs),
            max_reconnect_delay: secs(c.max_reconnect_delay_secs),
            max_reconnect_attempts: c.max_reconnect_attempts,
            stats_interval: secs(c.stats_interval_secs),
            round_trip_timeout: defaults.round_trip_timeout,
        };

        let session = SessionOptions {
            selection: self.encoder.selection,
            warmup_frames: self.encoder.warmup_frames,
            keyframe_secs: self.encoder.keyframe_secs.max(1),
            max_error_rate: self.encoder.max_error_rate.clamp(0.0, 1.0),
            ..SessionOptions::default()
        };

        StreamerOptions {
            tuning,
            session,
            adaptive_quality: self.adaptive.enabled,
            thresholds: self.adaptive.thresholds,
            sample_interval: secs(self.adaptive.sample_interval_secs),
            quality_interval: secs(self.adaptive.interval_secs),
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = CastlineConfig::default_toml().unwrap();
        assert!(text.contains("[stream]"));
        assert!(text.contains("max_reconnect_attempts"));
        assert!(text.contains("[adaptive.thresholds]"));
    }

    #[test]
    fn roundtrip_config() {
        let text = CastlineConfig::default_toml().unwrap();
        let parsed = CastlineConfig::parse(&text).unwrap();
        assert_eq!(parsed, CastlineConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed = CastlineConfig::parse(
            r#"
            [stream]
            rtmp_url = "rtmp://live.example.com/app"
            stream_key = "abc"

            [encoder]
            selection = "software_only"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.stream.rtmp_url, "rtmp://live.example.com/app");
        assert_eq!(parsed.stream.frame_rate, 30);
        assert_eq!(parsed.encoder.selection, EncoderSelection::SoftwareOnly);
        assert_eq!(parsed.connection, ConnectionConfig::default());
    }

    #[test]
    fn default_options_match_core_defaults() {
        let options = CastlineConfig::default().streamer_options();
        assert_eq!(options.tuning, ConnectionTuning::default());
        assert!(!options.adaptive_quality);
        assert_eq!(options.quality_interval, Duration::from_secs(5));
    }

    #[test]
    fn zero_intervals_are_raised() {
        let mut cfg = CastlineConfig::default();
        cfg.connection.health_check_interval_secs = 0;
        cfg.connection.max_connection_failures = 0;
        let tuning = cfg.streamer_options().tuning;
        assert_eq!(tuning.health_check_interval, Duration::from_secs(1));
        assert_eq!(tuning.max_connection_failures, 1);
    }
}
