//! Host performance sampling.
//!
//! [`SystemProbe`] reads CPU load and process memory through `sysinfo`
//! and the hottest thermal zone from `/sys/class/thermal`. The sampler
//! task publishes a [`PerformanceSample`] on a watch channel every
//! interval, folding in the encoder's own health counters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::telemetry::stats::EncoderHealth;

// ── ThermalLevel ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ThermalLevel {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalLevel {
    pub fn from_celsius(celsius: f32) -> Self {
        match celsius {
            c if c >= 95.0 => Self::Critical,
            c if c >= 85.0 => Self::Serious,
            c if c >= 70.0 => Self::Fair,
            _ => Self::Nominal,
        }
    }
}

// ── PerformanceSample ────────────────────────────────────────────

/// One reading of host and encoder load.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Global CPU usage, 0..=100.
    pub cpu_percent: f32,
    /// Resident memory of this process.
    pub memory_mb: u64,
    pub thermal: ThermalLevel,
    pub compression_error_rate: f64,
    pub last_compression_latency: Duration,
}

/// Host-side part of a [`PerformanceSample`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostReading {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub thermal: ThermalLevel,
}

/// Source of host readings. Injected in tests.
pub trait PerformanceProbe: Send + 'static {
    fn read(&mut self) -> HostReading;
}

impl<P: PerformanceProbe + ?Sized> PerformanceProbe for Box<P> {
    fn read(&mut self) -> HostReading {
        (**self).read()
    }
}

// ── SystemProbe ──────────────────────────────────────────────────

pub struct SystemProbe {
    system: System,
    pid: Option<Pid>,
    thermal_root: PathBuf,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::with_thermal_root("/sys/class/thermal")
    }

    pub fn with_thermal_root(root: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // First CPU reading is a baseline for the next delta.
        system.refresh_cpu();
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
            thermal_root: root.into(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceProbe for SystemProbe {
    fn read(&mut self) -> HostReading {
        self.system.refresh_cpu();
        let cpu_percent = self.system.global_cpu_info().cpu_usage().clamp(0.0, 100.0);

        let memory_mb = match self.pid {
            Some(pid) if self.system.refresh_process(pid) => self
                .system
                .process(pid)
                .map_or(0, |p| p.memory() / (1024 * 1024)),
            _ => 0,
        };

        let thermal = hottest_zone(&self.thermal_root)
            .map(ThermalLevel::from_celsius)
            .unwrap_or_default();

        HostReading {
            cpu_percent,
            memory_mb,
            thermal,
        }
    }
}

/// Highest temperature across `thermal_zone*/temp` under `root`, in °C.
fn hottest_zone(root: &Path) -> Option<f32> {
    fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
        .filter_map(|e| fs::read_to_string(e.path().join("temp")).ok())
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .map(|millidegrees| millidegrees as f32 / 1000.0)
        .reduce(f32::max)
}

// ── Sampler task ─────────────────────────────────────────────────

/// Sample `probe` every `interval` until `cancel` fires.
pub async fn run_sampler<P: PerformanceProbe>(
    mut probe: P,
    health: Arc<EncoderHealth>,
    interval: Duration,
    tx: watch::Sender<PerformanceSample>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let host = probe.read();
                let encoder = health.snapshot();
                let sample = PerformanceSample {
                    cpu_percent: host.cpu_percent,
                    memory_mb: host.memory_mb,
                    thermal: host.thermal,
                    compression_error_rate: encoder.error_rate,
                    last_compression_latency: encoder.last_latency,
                };
                if tx.send(sample).is_err() {
                    break;
                }
            }
        }
    }
    debug!("performance sampler stopped");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(HostReading);

    impl PerformanceProbe for FixedProbe {
        fn read(&mut self) -> HostReading {
            self.0
        }
    }

    #[test]
    fn thermal_thresholds() {
        assert_eq!(ThermalLevel::from_celsius(40.0), ThermalLevel::Nominal);
        assert_eq!(ThermalLevel::from_celsius(70.0), ThermalLevel::Fair);
        assert_eq!(ThermalLevel::from_celsius(85.5), ThermalLevel::Serious);
        assert_eq!(ThermalLevel::from_celsius(101.0), ThermalLevel::Critical);
        assert!(ThermalLevel::Critical > ThermalLevel::Serious);
    }

    #[test]
    fn hottest_zone_wins() {
        let root = std::env::temp_dir().join(format!("castline-thermal-{}", std::process::id()));
        for (zone, temp) in [("thermal_zone0", "45000\n"), ("thermal_zone1", "88500\n")] {
            fs::create_dir_all(root.join(zone)).unwrap();
            fs::write(root.join(zone).join("temp"), temp).unwrap();
        }
        fs::create_dir_all(root.join("cooling_device0")).unwrap();

        assert_eq!(hottest_zone(&root), Some(88.5));
        let mut probe = SystemProbe::with_thermal_root(&root);
        assert_eq!(probe.read().thermal, ThermalLevel::Serious);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_thermal_root_is_nominal() {
        let mut probe = SystemProbe::with_thermal_root("/nonexistent/castline");
        let reading = probe.read();
        assert_eq!(reading.thermal, ThermalLevel::Nominal);
        assert!((0.0..=100.0).contains(&reading.cpu_percent));
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_folds_in_encoder_health() {
        let health = Arc::new(EncoderHealth::default());
        health.set_error_rate(0.05);
        health.record_success(Duration::from_millis(7));
        let (tx, mut rx) = watch::channel(PerformanceSample::default());
        let cancel = CancellationToken::new();
        let probe = FixedProbe(HostReading {
            cpu_percent: 91.0,
            memory_mb: 120,
            thermal: ThermalLevel::Fair,
        });
        let task = tokio::spawn(run_sampler(
            probe,
            health,
            Duration::from_secs(2),
            tx,
            cancel.clone(),
        ));

        rx.changed().await.unwrap();
        let sample = *rx.borrow();
        assert_eq!(sample.cpu_percent, 91.0);
        assert_eq!(sample.thermal, ThermalLevel::Fair);
        assert_eq!(sample.compression_error_rate, 0.05);
        assert_eq!(sample.last_compression_latency, Duration::from_millis(7));

        cancel.cancel();
        task.await.unwrap();
    }
}
