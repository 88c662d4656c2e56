//! Adaptive quality control.
//!
//! Turns a [`PerformanceSample`] into bounded bitrate / frame-rate
//! adjustments. Resolution is never touched, and neither value ever
//! leaves the [`QualityBounds`] derived from the user's own settings.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::settings::Settings;
use crate::telemetry::{PerformanceSample, ThermalLevel};

/// The single most pressing issue in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerformanceIssue {
    None,
    CpuOverload,
    MemoryOverload,
    ThermalThrottling,
}

/// Overload thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub thermal: ThermalLevel,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            memory_mb: 700,
            thermal: ThermalLevel::Serious,
        }
    }
}

impl PerformanceIssue {
    /// Classify with priority thermal > cpu > memory.
    pub fn classify(sample: &PerformanceSample, thresholds: &QualityThresholds) -> Self {
        if sample.thermal >= thresholds.thermal {
            Self::ThermalThrottling
        } else if sample.cpu_percent > thresholds.cpu_percent {
            Self::CpuOverload
        } else if sample.memory_mb > thresholds.memory_mb {
            Self::MemoryOverload
        } else {
            Self::None
        }
    }

    /// `(bitrate kbps, frame rate)` deltas for this issue.
    fn deltas(self) -> (i64, i64) {
        match self {
            Self::None => (100, 1),
            Self::CpuOverload => (-200, -2),
            Self::MemoryOverload => (-300, 0),
            Self::ThermalThrottling => (-500, -5),
        }
    }
}

/// Limits derived from the user's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityBounds {
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub min_frame_rate: u32,
    pub max_frame_rate: u32,
}

impl QualityBounds {
    /// Bitrate within [85 %, 110 %] of the user's; frame rate may drop
    /// by at most `min(5, user / 10)` and never rises above the user's.
    pub fn from_user(user: &Settings) -> Self {
        let bitrate = u64::from(user.video_bitrate_kbps);
        let fps = user.frame_rate.max(1);
        let max_drop = (fps / 10).min(5);
        Self {
            min_bitrate_kbps: (bitrate * 85 / 100) as u32,
            max_bitrate_kbps: (bitrate * 110 / 100) as u32,
            min_frame_rate: fps.saturating_sub(max_drop).max(1),
            max_frame_rate: fps,
        }
    }
}

pub struct QualityController {
    enabled: bool,
    thresholds: QualityThresholds,
    bounds: Option<QualityBounds>,
    last_issue: PerformanceIssue,
}

impl QualityController {
    pub fn new(enabled: bool, thresholds: QualityThresholds) -> Self {
        Self {
            enabled,
            thresholds,
            bounds: None,
            last_issue: PerformanceIssue::None,
        }
    }

    /// Fix the bounds for a new session.
    pub fn begin_session(&mut self, user: &Settings) {
        self.bounds = Some(QualityBounds::from_user(user));
        self.last_issue = PerformanceIssue::None;
    }

    pub fn bounds(&self) -> Option<QualityBounds> {
        self.bounds
    }

    pub fn last_issue(&self) -> PerformanceIssue {
        self.last_issue
    }

    /// Settings for the next interval.
    ///
    /// With adaptation disabled this is `user` unchanged. Otherwise the
    /// result is `current` moved by the issue's deltas, clamped to the
    /// session bounds, with the user's resolution. With no issue, values
    /// step back toward the user's but never past them.
    pub fn propose_adjustment(
        &mut self,
        current: &Settings,
        user: &Settings,
        performance: &PerformanceSample,
    ) -> Settings {
        if !self.enabled {
            return user.clone();
        }
        let bounds = *self
            .bounds
            .get_or_insert_with(|| QualityBounds::from_user(user));
        let issue = PerformanceIssue::classify(performance, &self.thresholds);
        if issue != self.last_issue {
            debug!(
                ?issue,
                cpu = performance.cpu_percent,
                memory_mb = performance.memory_mb,
                thermal = ?performance.thermal,
                "performance issue changed"
            );
            self.last_issue = issue;
        }

        let (d_bitrate, d_fps) = issue.deltas();
        let (bitrate_ceiling, fps_ceiling) = match issue {
            PerformanceIssue::None => (
                user.video_bitrate_kbps.min(bounds.max_bitrate_kbps),
                bounds.max_frame_rate,
            ),
            _ => (bounds.max_bitrate_kbps, bounds.max_frame_rate),
        };

        let bitrate = step(
            current.video_bitrate_kbps,
            d_bitrate,
            bounds.min_bitrate_kbps,
            bitrate_ceiling,
        );
        let frame_rate = step(current.frame_rate, d_fps, bounds.min_frame_rate, fps_ceiling);

        Settings {
            video_width: user.video_width,
            video_height: user.video_height,
            video_bitrate_kbps: bitrate,
            frame_rate,
            ..current.clone()
        }
    }
}

/// Move `value` by `delta`, clamped to `[min, max]`.
fn step(value: u32, delta: i64, min: u32, max: u32) -> u32 {
    (i64::from(value) + delta).clamp(i64::from(min), i64::from(max.max(min))) as u32
}

// ── Tests ────────────────────────────────────────────────────────
