//! The public streaming facade.
//!
//! A [`Streamer`] wires the pieces together for one ingest session:
//!
//! ```text
//! submit_frame ─► [bounded queue] ─► castline-frames thread
//!                                     condition ─► encode ─► try_publish
//!                                                              │
//!  sampler ─► quality loop ─► target settings ──┘              ▼
//!                                                     connection actor
//! ```
//!
//! Conditioning and encoding share one OS thread, so encoder
//! reconfiguration never overlaps an encode call.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionTuning, SharedClientFactory, StreamStatus};
use crate::encoder::{EncoderFactory, EncoderSession, RecoveryAction, SessionOptions, SoftwareFactory};
use crate::error::{EncoderError, ErrorKind, StreamError};
use crate::frame::{FrameConditioner, MediaClock, RawFrame};
use crate::quality::{QualityController, QualityThresholds};
use crate::settings::Settings;
use crate::task::TaskSet;
use crate::telemetry::{
    EncoderHealth, PerformanceProbe, PerformanceSample, SystemProbe, TransmissionStats,
    run_sampler,
};

/// Builds an encoder factory for each session's frame thread.
pub type SharedEncoderFactory = Arc<dyn Fn() -> Box<dyn EncoderFactory> + Send + Sync>;

/// Builds the host probe for each session's sampler.
pub type SharedProbeFactory = Arc<dyn Fn() -> Box<dyn PerformanceProbe> + Send + Sync>;

/// Streamer-wide tuning, fixed for the streamer's lifetime.
#[derive(Debug, Clone)]
pub struct StreamerOptions {
    pub tuning: ConnectionTuning,
    pub session: SessionOptions,
    /// Opt in to bitrate / frame-rate adaptation.
    pub adaptive_quality: bool,
    pub thresholds: QualityThresholds,
    pub sample_interval: Duration,
    pub quality_interval: Duration,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            tuning: ConnectionTuning::default(),
            session: SessionOptions::default(),
            adaptive_quality: false,
            thresholds: QualityThresholds::default(),
            sample_interval: Duration::from_secs(2),
            quality_interval: Duration::from_secs(5),
        }
    }
}

// ── Streamer ─────────────────────────────────────────────────────

pub struct Streamer {
    connection: ConnectionHandle,
    options: StreamerOptions,
    encoders: SharedEncoderFactory,
    probes: SharedProbeFactory,
    stats: Arc<TransmissionStats>,
    health: Arc<EncoderHealth>,
    tasks: TaskSet,
    pipeline: Option<FramePipeline>,
}

impl Streamer {
    /// Must be called inside a tokio runtime.
    pub fn new(
        clients: SharedClientFactory,
        encoders: SharedEncoderFactory,
        options: StreamerOptions,
    ) -> Self {
        let stats = Arc::new(TransmissionStats::default());
        let health = Arc::new(EncoderHealth::default());
        let connection =
            ConnectionHandle::spawn(clients, options.tuning.clone(), stats.clone(), health.clone());
        Self {
            connection,
            options,
            encoders,
            probes: Arc::new(|| Box::new(SystemProbe::new()) as Box<dyn PerformanceProbe>),
            stats,
            health,
            tasks: TaskSet::new(),
            pipeline: None,
        }
    }

    /// A streamer using the built-in software encoder.
    pub fn with_software_encoder(clients: SharedClientFactory, options: StreamerOptions) -> Self {
        Self::new(
            clients,
            Arc::new(|| Box::new(SoftwareFactory) as Box<dyn EncoderFactory>),
            options,
        )
    }

    /// Replace the host probe used by adaptive quality.
    pub fn with_probe(mut self, probes: SharedProbeFactory) -> Self {
        self.probes = probes;
        self
    }

    /// Start a session.
    ///
    /// Configuration problems and `AlreadyActive` are returned without
    /// side effects. A failed first connection attempt is returned too,
    /// but the frame pipeline keeps running when a reconnect is pending.
    pub async fn start(&mut self, settings: Settings) -> Result<(), StreamError> {
        if self.connection.status().state.can_start() {
            self.shutdown_pipeline().await;
        }

        let result = self.connection.start(settings.clone()).await;
        match &result {
            Err(StreamError::AlreadyActive(_)) => return result,
            Err(e) if e.kind() == ErrorKind::Configuration => return result,
            _ => {}
        }

        self.health.clear_fatal();
        let pipeline = FramePipeline::spawn(
            &settings,
            (self.encoders)(),
            self.options.session.clone(),
            self.connection.clone(),
            self.stats.clone(),
            self.health.clone(),
        )?;
        if self.options.adaptive_quality {
            self.spawn_adaptation(&pipeline);
        }
        self.pipeline = Some(pipeline);
        result
    }

    /// Stop the session. A no-op when idle.
    pub async fn stop(&mut self) -> Result<(), StreamError> {
        self.connection.stop().await?;
        self.shutdown_pipeline().await;
        Ok(())
    }

    /// Queue a frame without blocking.
    ///
    /// While streaming, a frame that does not fit the queue is counted
    /// as failed. Outside a session frames are ignored.
    pub fn submit_frame(&self, frame: RawFrame) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        if pipeline.frames.try_send(frame).is_err() && self.connection.status().state.is_streaming()
        {
            self.stats.record_dropped();
        }
    }

    /// Adopt new user settings.
    ///
    /// The snapshot is validated like one passed to [`Streamer::start`].
    /// Only dimension, bitrate and frame-rate changes reach the encoder;
    /// returns whether they did. URL and key changes apply on the next
    /// start.
    pub fn apply_settings(&mut self, settings: Settings) -> Result<bool, StreamError> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(StreamError::NotConnected);
        };
        settings.validate()?;
        let previous = pipeline.user.borrow().clone();
        if settings.rtmp_url != previous.rtmp_url || settings.stream_key != previous.stream_key {
            warn!("ingest url or stream key changed; takes effect on next start");
        }
        if !settings.materially_differs(&previous) {
            return Ok(false);
        }
        info!(
            width = settings.video_width,
            height = settings.video_height,
            bitrate = settings.video_bitrate_kbps,
            fps = settings.frame_rate,
            "applying new stream settings"
        );
        pipeline.user.send_replace(settings.clone());
        pipeline.target.send_replace(settings);
        Ok(true)
    }

    pub fn status(&self) -> StreamStatus {
        self.connection.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.connection.subscribe()
    }

    /// Settings the frame thread currently encodes with, after any
    /// quality adjustment.
    pub fn effective_settings(&self) -> Option<Settings> {
        self.pipeline.as_ref().map(|p| p.target.borrow().clone())
    }

    pub fn stats(&self) -> &Arc<TransmissionStats> {
        &self.stats
    }

    fn spawn_adaptation(&mut self, pipeline: &FramePipeline) {
        let initial = PerformanceSample::default();
        let (perf_tx, perf_rx) = watch::channel(initial);

        let probe = (self.probes)();
        let health = self.health.clone();
        let interval = self.options.sample_interval;
        self.tasks.spawn("sampler", move |token| {
            run_sampler(probe, health, interval, perf_tx, token)
        });

        let controller = QualityController::new(true, self.options.thresholds);
        let target = pipeline.target.clone();
        let user = pipeline.user.subscribe();
        let interval = self.options.quality_interval;
        self.tasks.spawn("quality", move |token| {
            run_quality_loop(controller, perf_rx, user, target, interval, token)
        });
    }

    async fn shutdown_pipeline(&mut self) {
        self.tasks.cancel_all();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}

// ── Quality loop ─────────────────────────────────────────────────

async fn run_quality_loop(
    mut controller: QualityController,
    performance: watch::Receiver<PerformanceSample>,
    mut user: watch::Receiver<Settings>,
    target: Arc<watch::Sender<Settings>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    controller.begin_session(&user.borrow_and_update());
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if user.has_changed().unwrap_or(false) {
                    controller.begin_session(&user.borrow_and_update());
                }
                let user_settings = user.borrow().clone();
                let current = target.borrow().clone();
                let sample = *performance.borrow();
                let proposed = controller.propose_adjustment(&current, &user_settings, &sample);
                if proposed != current {
                    info!(
                        issue = ?controller.last_issue(),
                        bitrate = proposed.video_bitrate_kbps,
                        fps = proposed.frame_rate,
                        "quality adjusted"
                    );
                    target.send_replace(proposed);
                }
            }
        }
    }
    debug!("quality loop stopped");
}

// ── Frame pipeline ───────────────────────────────────────────────

struct FramePipeline {
    frames: mpsc::Sender<RawFrame>,
    /// Settings the frame thread encodes with.
    target: Arc<watch::Sender<Settings>>,
    /// Settings the user asked for.
    user: Arc<watch::Sender<Settings>>,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl FramePipeline {
    fn spawn(
        settings: &Settings,
        encoders: Box<dyn EncoderFactory>,
        options: SessionOptions,
        connection: ConnectionHandle,
        stats: Arc<TransmissionStats>,
        health: Arc<EncoderHealth>,
    ) -> Result<Self, StreamError> {
        let (frames, rx) = mpsc::channel(settings.buffer_size.max(1));
        let (target, target_rx) = watch::channel(settings.clone());
        let (user, _) = watch::channel(settings.clone());
        let cancel = CancellationToken::new();

        let worker = FrameWorker {
            conditioner: FrameConditioner::new(Arc::new(MediaClock::new())),
            session: EncoderSession::new(encoders, options, health, cancel.clone()),
            status: connection.subscribe(),
            connection,
            stats,
            target: target_rx,
            cancel: cancel.clone(),
            failing: false,
        };
        let thread = std::thread::Builder::new()
            .name("castline-frames".into())
            .spawn(move || worker.run(rx))
            .map_err(|e| StreamError::Other(format!("cannot spawn frame thread: {e}")))?;

        Ok(Self {
            frames,
            target: Arc::new(target),
            user: Arc::new(user),
            cancel,
            thread,
        })
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.frames);
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => debug!("frame thread joined"),
            Ok(Err(_)) => error!("frame thread panicked"),
            Err(e) => error!("failed to join frame thread: {e}"),
        }
    }
}

struct FrameWorker {
    conditioner: FrameConditioner,
    session: EncoderSession,
    connection: ConnectionHandle,
    status: watch::Receiver<StreamStatus>,
    stats: Arc<TransmissionStats>,
    target: watch::Receiver<Settings>,
    cancel: CancellationToken,
    /// Whether the last frame failed; only the first of a run is logged.
    failing: bool,
}

enum Step {
    Continue,
    Halt,
}

impl FrameWorker {
    fn run(mut self, mut frames: mpsc::Receiver<RawFrame>) {
        debug!("frame thread started");
        let mut settings = self.target.borrow_and_update().clone();
        let mut reconfigure = true;
        let mut was_streaming = false;

        while let Some(frame) = frames.blocking_recv() {
            if self.cancel.is_cancelled() {
                break;
            }
            let streaming = self.status.borrow().state.is_streaming();
            if !streaming {
                was_streaming = false;
                continue;
            }
            if !was_streaming {
                // A fresh publish stream must open on a key frame.
                self.session.request_keyframe();
                was_streaming = true;
            }
            if self.target.has_changed().unwrap_or(false) {
                settings = self.target.borrow_and_update().clone();
                reconfigure = true;
            }

            if let Step::Halt = self.process(&frame, &settings, &mut reconfigure) {
                break;
            }
        }

        debug!(
            frames = self.conditioner.frames_conditioned(),
            backend = self.session.backend_name().unwrap_or("none"),
            "frame thread stopped"
        );
        self.session.teardown();
    }

    fn process(&mut self, frame: &RawFrame, settings: &Settings, reconfigure: &mut bool) -> Step {
        let sample = match self.conditioner.condition(frame, settings) {
            Ok(sample) => sample,
            Err(e) => {
                self.frame_failed(format_args!("frame conditioning failed: {e}"));
                return Step::Continue;
            }
        };

        if *reconfigure || !self.session.accepts(&sample) {
            match self.session.configure(settings, sample.format) {
                Ok(()) => *reconfigure = false,
                Err(EncoderError::FormatUnsupported(format)) => {
                    self.conditioner.recycle(sample);
                    self.stats.record_dropped();
                    if !self.conditioner.disable_format(format) {
                        return self.fatal(EncoderError::Fatal(
                            "encoder accepts none of the sample formats".into(),
                        ));
                    }
                    warn!(?format, "encoder refused sample format, falling back");
                    return Step::Continue;
                }
                Err(e) => {
                    self.conditioner.recycle(sample);
                    return self.fatal(e);
                }
            }
        }

        let encoded = self.session.encode(&sample);
        let format = sample.format;
        self.conditioner.recycle(sample);

        match encoded {
            Ok(unit) => {
                self.failing = false;
                match self.connection.try_publish(unit) {
                    Ok(()) => Step::Continue,
                    Err(StreamError::ChannelClosed) => Step::Halt,
                    Err(_) => {
                        self.stats.record_dropped();
                        Step::Continue
                    }
                }
            }
            Err(EncoderError::Frame { action, message, .. }) => {
                match action {
                    RecoveryAction::FallbackFormat => {
                        if !self.conditioner.disable_format(format) {
                            return self.fatal(EncoderError::Fatal(message));
                        }
                        *reconfigure = true;
                    }
                    RecoveryAction::RelieveMemory => {
                        let freed = self.conditioner.relieve_memory();
                        debug!(freed, "released pooled frame buffers");
                    }
                    RecoveryAction::Recreated | RecoveryAction::Skip => {}
                }
                self.frame_failed(format_args!("frame dropped: {message}"));
                Step::Continue
            }
            Err(EncoderError::NotConfigured) => {
                *reconfigure = true;
                self.stats.record_dropped();
                Step::Continue
            }
            Err(e) => self.fatal(e),
        }
    }

    fn frame_failed(&mut self, reason: std::fmt::Arguments<'_>) {
        self.stats.record_dropped();
        if !self.failing {
            warn!("{reason}");
            self.failing = true;
        }
    }

    fn fatal(&mut self, error: EncoderError) -> Step {
        error!("encoder pipeline stopped: {error}");
        self.stats.record_dropped();
        if self
            .connection
            .report_pipeline_failure(StreamError::Encoder(error))
            .is_err()
        {
            debug!("connection actor gone");
        }
        Step::Halt
    }
}

// ── Tests ────────────────────────────────────────────────────────
