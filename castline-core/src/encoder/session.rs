//! Encoder session: setup, warm-up, per-frame recovery.
//!
//! The session is owned by the frame thread, so configuration changes
//! and encode calls never overlap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::backend::{
    EncodedUnit, EncoderBackend, EncoderConfig, EncoderFactory, EncoderFault, EncoderSelection,
    RecoveryAction,
};
use crate::error::EncoderError;
use crate::frame::{EncoderSample, SampleFormat};
use crate::settings::Settings;
use crate::telemetry::EncoderHealth;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Solid frames pushed through a fresh backend before real ones.
    pub warmup_frames: u32,
    pub max_setup_attempts: u32,
    /// Multiplied by the attempt number.
    pub setup_backoff: Duration,
    /// Tier the setup chain starts from.
    pub selection: EncoderSelection,
    pub keyframe_secs: u32,
    pub error_window: usize,
    pub min_error_samples: usize,
    pub max_error_rate: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            warmup_frames: 5,
            max_setup_attempts: 3,
            setup_backoff: Duration::from_millis(50),
            selection: EncoderSelection::RequireHardware,
            keyframe_secs: 2,
            error_window: 50,
            min_error_samples: 10,
            max_error_rate: 0.10,
        }
    }
}

/// Rolling success/failure window.
#[derive(Debug)]
struct ErrorWindow {
    results: VecDeque<bool>,
    failures: usize,
    capacity: usize,
    min_samples: usize,
}

impl ErrorWindow {
    fn new(capacity: usize, min_samples: usize) -> Self {
        Self {
            results: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity: capacity.max(1),
            min_samples,
        }
    }

    fn record(&mut self, ok: bool) {
        if self.results.len() == self.capacity && self.results.pop_front() == Some(false) {
            self.failures -= 1;
        }
        self.results.push_back(ok);
        if !ok {
            self.failures += 1;
        }
    }

    /// Failure ratio, or 0 until enough results are in.
    fn rate(&self) -> f64 {
        if self.results.len() < self.min_samples {
            return 0.0;
        }
        self.failures as f64 / self.results.len() as f64
    }

    fn clear(&mut self) {
        self.results.clear();
        self.failures = 0;
    }
}

enum WarmupError {
    FormatUnsupported,
    Cancelled,
    Failed(String),
}

/// Owns one encoder backend at a time.
pub struct EncoderSession {
    factory: Box<dyn EncoderFactory>,
    options: SessionOptions,
    health: Arc<EncoderHealth>,
    cancel: CancellationToken,
    backend: Option<Box<dyn EncoderBackend>>,
    active: Option<EncoderConfig>,
    last_good: Option<EncoderConfig>,
    window: ErrorWindow,
    frames_since_key: u32,
}

impl EncoderSession {
    pub fn new(
        factory: Box<dyn EncoderFactory>,
        options: SessionOptions,
        health: Arc<EncoderHealth>,
        cancel: CancellationToken,
    ) -> Self {
        let window = ErrorWindow::new(options.error_window, options.min_error_samples);
        Self {
            factory,
            options,
            health,
            cancel,
            backend: None,
            active: None,
            last_good: None,
            window,
            frames_since_key: 0,
        }
    }

    /// Open (or adjust) the backend for `settings` in `format`.
    ///
    /// A bitrate / frame-rate only change is applied in place when the
    /// backend supports it. Anything else tears down and runs the full
    /// setup chain with warm-up.
    pub fn configure(&mut self, settings: &Settings, format: SampleFormat) -> Result<(), EncoderError> {
        let config = EncoderConfig::from_settings(settings, format, self.options.keyframe_secs);
        if self.active.as_ref() == Some(&config) && self.backend.is_some() {
            return Ok(());
        }

        if let (Some(active), Some(backend)) = (self.active.as_ref(), self.backend.as_mut()) {
            if active.rate_only_change(&config)
                && backend.update_rate(config.bitrate_kbps, config.frame_rate)
            {
                debug!(
                    bitrate = config.bitrate_kbps,
                    fps = config.frame_rate,
                    "encoder rate updated in place"
                );
                self.last_good = Some(config.clone());
                self.active = Some(config);
                return Ok(());
            }
        }

        self.close_backend();
        self.setup(config)
    }

    /// Whether `sample` matches the open configuration.
    pub fn accepts(&self, sample: &EncoderSample) -> bool {
        self.active.as_ref().is_some_and(|c| {
            c.format == sample.format && c.width == sample.width && c.height == sample.height
        })
    }

    /// The configuration currently open, if any.
    pub fn config(&self) -> Option<&EncoderConfig> {
        self.active.as_ref()
    }

    /// Name of the open backend.
    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref().map(|b| b.name())
    }

    /// Encode one sample, recovering locally where possible.
    ///
    /// `Err(Frame { .. })` means this frame was lost but the session is
    /// still usable; `Err(Fatal(_))` means it is not.
    pub fn encode(&mut self, sample: &EncoderSample) -> Result<EncodedUnit, EncoderError> {
        let interval = self.active.as_ref().map_or(1, |c| c.keyframe_interval);
        let backend = self.backend.as_mut().ok_or(EncoderError::NotConfigured)?;
        let keyframe = self.frames_since_key == 0;

        let started = Instant::now();
        match backend.encode(sample, keyframe) {
            Ok(unit) => {
                self.window.record(true);
                self.health.record_success(started.elapsed());
                self.health.set_error_rate(self.window.rate());
                self.frames_since_key = (self.frames_since_key + 1) % interval.max(1);
                Ok(unit)
            }
            Err(e) => {
                self.window.record(false);
                self.health.record_failure();
                warn!(fault = ?e.fault, frame = sample.frame_number, "encode failed: {}", e.message);
                let action = self.recover(e.fault)?;
                self.health.set_error_rate(self.window.rate());
                Err(EncoderError::Frame {
                    fault: e.fault,
                    action,
                    message: e.message,
                })
            }
        }
    }

    /// Force the next frame to be a key frame.
    pub fn request_keyframe(&mut self) {
        self.frames_since_key = 0;
    }

    /// Close the backend and forget every configuration.
    pub fn teardown(&mut self) {
        self.close_backend();
        self.last_good = None;
        self.window.clear();
    }

    // ── Internals ────────────────────────────────────────────────

    fn recover(&mut self, fault: EncoderFault) -> Result<RecoveryAction, EncoderError> {
        let action = match fault {
            EncoderFault::SessionInvalidated => {
                self.recreate()?;
                return Ok(RecoveryAction::Recreated);
            }
            EncoderFault::AllocationFailed => {
                if let Some(backend) = self.backend.as_mut() {
                    backend.relieve_memory();
                }
                RecoveryAction::RelieveMemory
            }
            EncoderFault::FormatUnsupported => RecoveryAction::FallbackFormat,
            EncoderFault::Unavailable | EncoderFault::Unknown => RecoveryAction::Skip,
        };

        if self.window.rate() > self.options.max_error_rate {
            warn!(
                error_rate = self.window.rate(),
                "encoder error rate over threshold, recreating"
            );
            self.recreate()?;
            return Ok(RecoveryAction::Recreated);
        }
        Ok(action)
    }

    /// Rebuild the backend from the last-known-good configuration.
    fn recreate(&mut self) -> Result<(), EncoderError> {
        let config = self.last_good.clone().ok_or(EncoderError::NotConfigured)?;
        self.close_backend();
        self.window.clear();
        self.health.record_recreation();
        self.setup(config).map_err(|e| {
            error!("encoder recreation failed: {e}");
            self.health.mark_fatal();
            EncoderError::Fatal(e.to_string())
        })
    }

    fn setup(&mut self, config: EncoderConfig) -> Result<(), EncoderError> {
        let mut attempts = 0;
        let mut reason = String::from("no encoder selection attempted");

        for selection in self.options.selection.chain_from() {
            if attempts >= self.options.max_setup_attempts {
                break;
            }
            if self.cancel.is_cancelled() {
                reason = "cancelled".into();
                break;
            }
            if attempts > 0 {
                std::thread::sleep(self.options.setup_backoff * attempts);
            }
            attempts += 1;

            let mut backend = match self.factory.create(&config, selection) {
                Ok(b) => b,
                Err(e) => {
                    debug!(?selection, attempt = attempts, "encoder creation failed: {e}");
                    reason = e.to_string();
                    continue;
                }
            };

            match self.warm_up(backend.as_mut(), &config) {
                Ok(()) => {
                    info!(
                        backend = backend.name(),
                        hardware = backend.is_hardware(),
                        format = ?config.format,
                        width = config.width,
                        height = config.height,
                        bitrate = config.bitrate_kbps,
                        fps = config.frame_rate,
                        "encoder session ready"
                    );
                    self.health.set_backend(backend.is_hardware());
                    self.health.clear_fatal();
                    self.backend = Some(backend);
                    self.last_good = Some(config.clone());
                    self.active = Some(config);
                    self.frames_since_key = 0;
                    return Ok(());
                }
                Err(WarmupError::FormatUnsupported) => {
                    backend.close();
                    return Err(EncoderError::FormatUnsupported(config.format));
                }
                Err(WarmupError::Cancelled) => {
                    backend.close();
                    reason = "cancelled during warm-up".into();
                    break;
                }
                Err(WarmupError::Failed(msg)) => {
                    backend.close();
                    debug!(?selection, attempt = attempts, "encoder warm-up failed: {msg}");
                    reason = msg;
                }
            }
        }

        Err(EncoderError::SetupFailed { attempts, reason })
    }

    fn warm_up(
        &self,
        backend: &mut dyn EncoderBackend,
        config: &EncoderConfig,
    ) -> Result<(), WarmupError> {
        let step = Duration::from_nanos(1_000_000_000 / u64::from(config.frame_rate.max(1)));
        for i in 0..self.options.warmup_frames {
            if self.cancel.is_cancelled() {
                return Err(WarmupError::Cancelled);
            }
            let mut sample =
                EncoderSample::solid(config.format, config.width, config.height, step * i);
            sample.duration = step;
            if let Err(e) = backend.encode(&sample, i == 0) {
                return Err(match e.fault {
                    EncoderFault::FormatUnsupported => WarmupError::FormatUnsupported,
                    _ => WarmupError::Failed(e.to_string()),
                });
            }
        }
        Ok(())
    }

    fn close_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        self.active = None;
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.close_backend();
    }
}

// ── Tests ────────────────────────────────────────────────────────
