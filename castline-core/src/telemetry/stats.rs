//! Shared counters: transmission statistics and encoder health.
//!
//! Written by the connection actor and the frame thread, read by the
//! quality loop and status observers. Everything is an atomic; readers
//! take a [`StatsSnapshot`] / [`EncoderHealthSnapshot`].

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── ConnectionQuality ────────────────────────────────────────────

/// Coarse link quality from delivery ratio and latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl ConnectionQuality {
    /// Grade a link. `latency` of `None` means not measured yet.
    pub fn assess(attempted: u64, succeeded: u64, latency: Option<Duration>) -> Self {
        if attempted == 0 {
            return Self::Unknown;
        }
        let ratio = succeeded as f64 / attempted as f64;
        let ms = latency.map_or(0, |l| l.as_millis());
        match (ratio, ms) {
            (r, l) if r >= 0.98 && l < 50 => Self::Excellent,
            (r, l) if r >= 0.95 && l < 150 => Self::Good,
            (r, l) if r >= 0.85 && l < 400 => Self::Fair,
            _ => Self::Poor,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Excellent => 0,
            Self::Good => 1,
            Self::Fair => 2,
            Self::Poor => 3,
            Self::Unknown => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Excellent,
            1 => Self::Good,
            2 => Self::Fair,
            3 => Self::Poor,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ── TransmissionStats ────────────────────────────────────────────

/// Per-session transmission counters.
#[derive(Debug)]
pub struct TransmissionStats {
    frames_attempted: AtomicU64,
    frames_succeeded: AtomicU64,
    frames_failed: AtomicU64,
    bytes_sent: AtomicU64,
    /// `f64` bits.
    current_fps: AtomicU64,
    latency_us: AtomicU64,
    quality: AtomicU8,
}

/// Point-in-time copy of [`TransmissionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_attempted: u64,
    pub frames_succeeded: u64,
    pub frames_failed: u64,
    pub bytes_sent: u64,
    pub current_fps: f64,
    pub network_latency: Option<Duration>,
    pub connection_quality: ConnectionQuality,
}

impl Default for TransmissionStats {
    fn default() -> Self {
        Self {
            frames_attempted: AtomicU64::new(0),
            frames_succeeded: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            current_fps: AtomicU64::new(0f64.to_bits()),
            latency_us: AtomicU64::new(0),
            quality: AtomicU8::new(ConnectionQuality::Unknown.to_u8()),
        }
    }
}

impl TransmissionStats {
    /// Zero everything for a new session.
    pub fn reset(&self) {
        for counter in [
            &self.frames_attempted,
            &self.frames_succeeded,
            &self.frames_failed,
            &self.bytes_sent,
            &self.latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.current_fps.store(0f64.to_bits(), Ordering::Relaxed);
        self.quality
            .store(ConnectionQuality::Unknown.to_u8(), Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.frames_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, bytes: u64) {
        self.frames_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame that never reached the publish path (dropped, failed to
    /// condition or encode) counts as attempted and failed.
    pub fn record_dropped(&self) {
        self.record_attempt();
        self.record_failure();
    }

    pub fn set_fps(&self, fps: f64) {
        self.current_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        let us = latency.map_or(0, |l| (l.as_micros() as u64).max(1));
        self.latency_us.store(us, Ordering::Relaxed);
    }

    pub fn set_quality(&self, quality: ConnectionQuality) {
        self.quality.store(quality.to_u8(), Ordering::Relaxed);
    }

    pub fn attempted(&self) -> u64 {
        self.frames_attempted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.frames_succeeded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency_us = self.latency_us.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_attempted: self.frames_attempted.load(Ordering::Relaxed),
            frames_succeeded: self.frames_succeeded.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            current_fps: f64::from_bits(self.current_fps.load(Ordering::Relaxed)),
            network_latency: (latency_us > 0).then(|| Duration::from_micros(latency_us)),
            connection_quality: ConnectionQuality::from_u8(self.quality.load(Ordering::Relaxed)),
        }
    }
}

// ── EncoderHealth ────────────────────────────────────────────────

/// Encoder counters written by the encoder session.
#[derive(Debug, Default)]
pub struct EncoderHealth {
    frames_encoded: AtomicU64,
    frames_failed: AtomicU64,
    recreations: AtomicU64,
    /// Rolling error rate in parts per million.
    error_rate_ppm: AtomicU64,
    last_latency_us: AtomicU64,
    hardware: AtomicBool,
    fatal: AtomicBool,
}

/// Point-in-time copy of [`EncoderHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EncoderHealthSnapshot {
    pub frames_encoded: u64,
    pub frames_failed: u64,
    pub recreations: u64,
    pub error_rate: f64,
    pub last_latency: Duration,
    pub hardware: bool,
    pub fatal: bool,
}

impl EncoderHealth {
    pub fn record_success(&self, latency: Duration) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recreation(&self) {
        self.recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_error_rate(&self, rate: f64) {
        let ppm = (rate.clamp(0.0, 1.0) * 1_000_000.0) as u64;
        self.error_rate_ppm.store(ppm, Ordering::Relaxed);
    }

    pub fn set_backend(&self, hardware: bool) {
        self.hardware.store(hardware, Ordering::Relaxed);
    }

    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub fn clear_fatal(&self) {
        self.fatal.store(false, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> EncoderHealthSnapshot {
        EncoderHealthSnapshot {
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            recreations: self.recreations.load(Ordering::Relaxed),
            error_rate: self.error_rate_ppm.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            last_latency: Duration::from_micros(self.last_latency_us.load(Ordering::Relaxed)),
            hardware: self.hardware.load(Ordering::Relaxed),
            fatal: self.is_fatal(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_grades() {
        let ms = |v| Some(Duration::from_millis(v));
        assert_eq!(ConnectionQuality::assess(0, 0, None), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::assess(100, 100, ms(10)), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::assess(100, 100, None), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::assess(100, 96, ms(10)), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::assess(100, 100, ms(200)), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::assess(100, 50, ms(10)), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::assess(100, 100, ms(900)), ConnectionQuality::Poor);
    }

    #[test]
    fn transmission_counters() {
        let stats = TransmissionStats::default();
        stats.record_attempt();
        stats.record_success(1000);
        stats.record_dropped();
        stats.set_fps(29.5);
        stats.set_latency(Some(Duration::from_millis(12)));
        stats.set_quality(ConnectionQuality::Good);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_attempted, 2);
        assert_eq!(snap.frames_succeeded, 1);
        assert_eq!(snap.frames_failed, 1);
        assert_eq!(snap.bytes_sent, 1000);
        assert_eq!(snap.current_fps, 29.5);
        assert_eq!(snap.network_latency, Some(Duration::from_millis(12)));
        assert_eq!(snap.connection_quality, ConnectionQuality::Good);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn encoder_health_snapshot() {
        let health = EncoderHealth::default();
        health.record_success(Duration::from_millis(4));
        health.record_failure();
        health.set_error_rate(0.125);
        health.mark_fatal();

        let snap = health.snapshot();
        assert_eq!(snap.frames_encoded, 1);
        assert_eq!(snap.frames_failed, 1);
        assert_eq!(snap.error_rate, 0.125);
        assert_eq!(snap.last_latency, Duration::from_millis(4));
        assert!(snap.fatal);
        health.clear_fatal();
        assert!(!health.is_fatal());
    }
}
