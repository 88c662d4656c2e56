//! Rolling throughput and latency estimation.
//!
//! Tracks bytes sent per frame over a rolling window and derives bytes
//! per second and frames per second. Round-trip samples feed an EWMA
//! latency estimate (α = 1/8).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling-window throughput meter.
#[derive(Debug)]
pub struct ThroughputMeter {
    /// `(when, bytes)` per published frame.
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
    smoothed_rtt_us: u64,
}

impl ThroughputMeter {
    /// Meter with a 2-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(2))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(128),
            window,
            total_bytes: 0,
            smoothed_rtt_us: 0,
        }
    }

    /// Record one frame of `bytes` sent at `when`.
    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    /// Feed a round-trip sample into the EWMA.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = (rtt.as_micros() as u64).max(1);
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us;
        } else {
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
    }

    /// Bytes per second over the window ending at `now`.
    pub fn bytes_per_sec(&mut self, now: Instant) -> u64 {
        self.evict(now);
        match self.span(now) {
            Some(secs) => (self.total_bytes as f64 / secs) as u64,
            None => 0,
        }
    }

    /// Frames per second over the window ending at `now`.
    pub fn frames_per_sec(&mut self, now: Instant) -> f64 {
        self.evict(now);
        match self.span(now) {
            Some(secs) => self.samples.len() as f64 / secs,
            None => 0.0,
        }
    }

    /// Smoothed round-trip time, `None` until measured.
    pub fn latency(&self) -> Option<Duration> {
        (self.smoothed_rtt_us > 0).then(|| Duration::from_micros(self.smoothed_rtt_us))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Forget everything, e.g. on a new session.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.total_bytes = 0;
        self.smoothed_rtt_us = 0;
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Seconds covered by the window: the full window once it has
    /// filled, else the time since the oldest sample.
    fn span(&self, now: Instant) -> Option<f64> {
        let (first, _) = self.samples.front()?;
        let since = now.saturating_duration_since(*first);
        let span = since.min(self.window).max(Duration::from_millis(1));
        Some(span.as_secs_f64())
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes = self.total_bytes.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
