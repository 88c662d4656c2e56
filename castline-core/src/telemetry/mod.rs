//! Statistics, throughput and host performance telemetry.

pub mod probe;
pub mod stats;
pub mod throughput;

pub use probe::{HostReading, PerformanceProbe, PerformanceSample, SystemProbe, ThermalLevel, run_sampler};
pub use stats::{
    ConnectionQuality, EncoderHealth, EncoderHealthSnapshot, StatsSnapshot, TransmissionStats,
};
pub use throughput::ThroughputMeter;
