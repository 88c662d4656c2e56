//! Connection manager actor.
//!
//! A single task owns the protocol client, the state machine and every
//! counter that decides reconnects. Callers talk to it through a
//! cloneable [`ConnectionHandle`]; health, statistics and reconnect
//! timers are background tasks that post messages back to the actor, so
//! no two transitions ever race.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::client::{ProtocolClient, SharedClientFactory};
use crate::connection::messages::ConnectionMessage;
use crate::connection::policy::ConnectionTuning;
use crate::connection::state::{ConnectionState, StreamStatus};
use crate::encoder::EncodedUnit;
use crate::error::{ErrorKind, StreamError};
use crate::settings::{IngestUrl, Settings};
use crate::task::TaskSet;
use crate::telemetry::{ConnectionQuality, EncoderHealth, ThroughputMeter, TransmissionStats};

const MAILBOX_SIZE: usize = 256;

/// Stats ticks between summary log lines.
const SUMMARY_EVERY: u64 = 15;

// ── Handle ───────────────────────────────────────────────────────

/// Cloneable front door to the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    status: watch::Receiver<StreamStatus>,
    stats: Arc<TransmissionStats>,
    cancel_token: CancellationToken,
}

impl ConnectionHandle {
    /// Spawn the actor and return a handle to it.
    pub fn spawn(
        factory: SharedClientFactory,
        tuning: ConnectionTuning,
        stats: Arc<TransmissionStats>,
        encoder: Arc<EncoderHealth>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(MAILBOX_SIZE);
        let (status_tx, status) = watch::channel(StreamStatus::default());
        let cancel_token = CancellationToken::new();

        let actor = ConnectionActor {
            receiver,
            mailbox: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            tasks: TaskSet::with_parent(&cancel_token),
            factory,
            tuning,
            stats: stats.clone(),
            encoder,
            status_tx,
            state: ConnectionState::Idle,
            message: String::from("idle"),
            client: None,
            session: None,
            meter: ThroughputMeter::new(),
            generation: 0,
            reconnect_attempts: 0,
            pending_attempt: 0,
            health_failures: 0,
            lost_fired: false,
            connection_losses: 0,
            last_poll: (0, 0),
            send_failing: false,
            stats_ticks: 0,
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            status,
            stats,
            cancel_token,
        }
    }

    /// Validate `settings`, connect and publish.
    ///
    /// Returns once the session is streaming or the first attempt has
    /// failed. A failed attempt may still have scheduled a reconnect.
    pub async fn start(&self, settings: Settings) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Start {
                settings,
                respond_to: tx,
            })
            .await?;
        rx.await?
    }

    /// Close the session. A no-op when idle.
    pub async fn stop(&self) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Stop { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn publish(&self, unit: EncodedUnit) -> Result<(), StreamError> {
        self.sender
            .send(ConnectionMessage::Publish { unit })
            .await?;
        Ok(())
    }

    /// Non-blocking publish for the frame thread.
    pub fn try_publish(&self, unit: EncodedUnit) -> Result<(), StreamError> {
        self.sender
            .try_send(ConnectionMessage::Publish { unit })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    StreamError::Other("publish queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => StreamError::ChannelClosed,
            })
    }

    /// Report a failure the frame pipeline could not recover from.
    pub fn report_pipeline_failure(&self, error: StreamError) -> Result<(), StreamError> {
        self.sender
            .try_send(ConnectionMessage::PipelineFailed { error })
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Latest published status.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> &Arc<TransmissionStats> {
        &self.stats
    }

    /// Stop the actor itself. Any open session is closed first.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

// ── Actor ────────────────────────────────────────────────────────

struct Session {
    settings: Settings,
    url: IngestUrl,
    key: String,
}

struct ConnectionActor {
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// For timers; weak so dropping every handle ends the actor.
    mailbox: mpsc::WeakSender<ConnectionMessage>,
    cancel_token: CancellationToken,
    tasks: TaskSet,
    factory: SharedClientFactory,
    tuning: ConnectionTuning,
    stats: Arc<TransmissionStats>,
    encoder: Arc<EncoderHealth>,
    status_tx: watch::Sender<StreamStatus>,

    state: ConnectionState,
    message: String,
    /// Present iff `state.has_handle()`.
    client: Option<Box<dyn ProtocolClient>>,
    session: Option<Session>,
    meter: ThroughputMeter,

    /// Bumped whenever pending reconnects must be ignored.
    generation: u64,
    /// Attempts made since the last successful session.
    reconnect_attempts: u32,
    /// Attempt shown in the status, 0 when none pending.
    pending_attempt: u32,
    health_failures: u32,
    lost_fired: bool,
    connection_losses: u32,
    /// `(attempted, succeeded)` at the previous health poll.
    last_poll: (u64, u64),
    send_failing: bool,
    stats_ticks: u64,
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!("connection actor started");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.handle_stop().await;
                    break;
                }
                msg = self.receiver.recv() => match msg {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        self.handle_stop().await;
                        break;
                    }
                }
            }
        }
        debug!("connection actor stopped");
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::Start {
                settings,
                respond_to,
            } => {
                let result = self.handle_start(settings).await;
                let _ = respond_to.send(result);
            }
            ConnectionMessage::Stop { respond_to } => {
                self.handle_stop().await;
                let _ = respond_to.send(());
            }
            ConnectionMessage::Publish { unit } => self.handle_publish(unit).await,
            ConnectionMessage::PipelineFailed { error } => self.handle_pipeline_failure(error).await,
            ConnectionMessage::HealthTick => self.check_health().await,
            ConnectionMessage::StatsTick => self.refresh_stats().await,
            ConnectionMessage::Reconnect { generation } => self.attempt_reconnect(generation).await,
        }
    }

    // ── Start / stop ─────────────────────────────────────────────

    async fn handle_start(&mut self, settings: Settings) -> Result<(), StreamError> {
        if !self.state.can_start() {
            return Err(StreamError::AlreadyActive(self.state.to_string()));
        }
        if !self.state.is_idle() {
            // Explicit start out of Error.
            self.reset_to_idle("restarting");
        }

        let url = match settings.validate() {
            Ok(url) => url,
            Err(e) => {
                warn!("rejected stream settings: {e}");
                self.message = e.to_string();
                self.publish_status();
                return Err(e);
            }
        };

        self.stats.reset();
        self.meter.clear();
        self.reconnect_attempts = 0;
        self.pending_attempt = 0;
        self.connection_losses = 0;
        info!(%url, "starting stream session");
        self.session = Some(Session {
            key: settings.sanitized_stream_key(),
            url,
            settings,
        });
        self.establish().await
    }

    async fn handle_stop(&mut self) {
        if self.state.is_idle() {
            return;
        }
        self.tasks.cancel_all();
        self.generation += 1;

        if let Some(client) = self.client.take() {
            let from = self.state;
            if self.state.begin_disconnect().is_ok() {
                self.log_transition(from);
                self.message = String::from("disconnecting");
                self.publish_status();
            }
            close_quietly(client).await;
        }
        self.reset_to_idle("stopped");
        info!("stream session stopped");
    }

    fn reset_to_idle(&mut self, message: &str) {
        self.tasks.cancel_all();
        self.generation += 1;
        let from = self.state;
        if self.state.finish_disconnect().is_err() {
            self.state = ConnectionState::Idle;
        }
        self.log_transition(from);
        self.pending_attempt = 0;
        self.message = message.to_string();
        self.publish_status();
    }

    // ── Establishing a session ───────────────────────────────────

    /// Connect, publish and verify. On failure the state is `Error` and
    /// a reconnect may be pending.
    async fn establish(&mut self) -> Result<(), StreamError> {
        let Some(session) = self.session.as_ref() else {
            return Err(StreamError::NotConnected);
        };
        let url = session.url.clone();
        let key = session.key.clone();
        let connect_timeout = session.settings.connection_timeout();

        self.transition(ConnectionState::begin_connect, format!("connecting to {url}"))?;
        let mut client = self.factory.create();

        match time::timeout(connect_timeout, client.connect(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.attempt_failed(client, ErrorKind::Network, e).await,
            Err(_) => {
                let e = StreamError::Timeout(connect_timeout);
                return self.attempt_failed(client, ErrorKind::Network, e).await;
            }
        }
        self.transition(ConnectionState::connected, "connected, publishing")?;

        match time::timeout(self.tuning.publish_timeout, client.publish(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let kind = match e {
                    StreamError::Authentication(_) => ErrorKind::Authentication,
                    _ => ErrorKind::Network,
                };
                return self.attempt_failed(client, kind, e).await;
            }
            Err(_) => {
                let e = StreamError::Timeout(self.tuning.publish_timeout);
                return self.attempt_failed(client, ErrorKind::Network, e).await;
            }
        }

        // Some servers accept the publish and then drop a bad key.
        time::sleep(self.tuning.publish_verify_delay).await;
        if !client.is_alive().await {
            let e = StreamError::Authentication(
                "server closed the stream after accepting publish".into(),
            );
            return self.attempt_failed(client, ErrorKind::Authentication, e).await;
        }

        self.client = Some(client);
        self.reconnect_attempts = 0;
        self.pending_attempt = 0;
        self.health_failures = 0;
        self.lost_fired = false;
        self.send_failing = false;
        self.last_poll = (self.stats.attempted(), self.stats.succeeded());
        self.transition(ConnectionState::begin_streaming, "streaming")?;
        self.start_monitors();
        info!(%url, "stream is live");
        Ok(())
    }

    async fn attempt_failed(
        &mut self,
        client: Box<dyn ProtocolClient>,
        kind: ErrorKind,
        error: StreamError,
    ) -> Result<(), StreamError> {
        close_quietly(client).await;
        warn!(%kind, "connection attempt failed: {error}");
        self.fail(kind, error.to_string());
        Err(error)
    }

    async fn attempt_reconnect(&mut self, generation: u64) {
        let pending = matches!(self.state, ConnectionState::Error { terminal: false, .. });
        if generation != self.generation || !pending {
            trace!(generation, "stale reconnect ignored");
            return;
        }
        self.reconnect_attempts += 1;
        info!(
            attempt = self.reconnect_attempts,
            max = self.tuning.max_reconnect_attempts,
            "reconnecting"
        );
        if let Some(client) = self.client.take() {
            close_quietly(client).await;
        }
        // Failures reschedule or go terminal inside `establish`.
        let _ = self.establish().await;
    }

    // ── Failure handling ─────────────────────────────────────────

    /// Move to `Error(kind)` and schedule a reconnect if allowed.
    fn fail(&mut self, kind: ErrorKind, reason: String) {
        self.tasks.cancel("health");
        self.tasks.cancel("stats");
        let from = self.state;
        if let Err(e) = self.state.fail(kind, false) {
            debug!("{e}");
        }
        self.log_transition(from);
        self.schedule_reconnect(kind, reason);
    }

    fn schedule_reconnect(&mut self, kind: ErrorKind, reason: String) {
        let auto = self
            .session
            .as_ref()
            .is_some_and(|s| s.settings.auto_reconnect);
        let retried = matches!(kind, ErrorKind::Network | ErrorKind::Authentication);
        let max = self.tuning.max_reconnect_attempts;

        if auto && retried && self.tuning.attempts_remain(self.reconnect_attempts) {
            let attempt = self.reconnect_attempts + 1;
            let delay = self.tuning.reconnect_delay(self.reconnect_attempts);
            self.generation += 1;
            let generation = self.generation;
            let mailbox = self.mailbox.clone();
            self.tasks.spawn("reconnect", move |token| async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = time::sleep(delay) => {
                        if let Some(tx) = mailbox.upgrade() {
                            let _ = tx.send(ConnectionMessage::Reconnect { generation }).await;
                        }
                    }
                }
            });
            info!(attempt, max, delay_secs = delay.as_secs(), "reconnect scheduled");
            self.pending_attempt = attempt;
            self.message = format!(
                "{reason}; reconnecting, attempt {attempt}/{max} in {}s",
                delay.as_secs()
            );
        } else {
            self.state.make_terminal();
            self.pending_attempt = 0;
            self.message = match kind {
                ErrorKind::Authentication => "authentication failed — verify stream key".into(),
                ErrorKind::Network if auto && retried => format!(
                    "{reason}; gave up after {} reconnect attempts, restart required",
                    self.reconnect_attempts
                ),
                _ => format!("{reason}; restart required"),
            };
            error!("{}", self.message);
        }
        self.publish_status();
    }

    async fn handle_connection_lost(&mut self) {
        if self.lost_fired {
            return;
        }
        self.lost_fired = true;
        self.connection_losses += 1;
        error!(
            failures = self.health_failures,
            "connection lost after repeated failed health checks"
        );
        if let Some(client) = self.client.take() {
            close_quietly(client).await;
        }
        self.fail(ErrorKind::Network, "connection lost".into());
    }

    async fn handle_pipeline_failure(&mut self, error: StreamError) {
        if !self.state.has_handle() {
            debug!("pipeline failure outside a session ignored: {error}");
            return;
        }
        error!("frame pipeline failed: {error}");
        self.tasks.cancel_all();
        self.generation += 1;
        if let Some(client) = self.client.take() {
            close_quietly(client).await;
        }
        let from = self.state;
        if self.state.fail(error.kind(), true).is_err() {
            self.state = ConnectionState::Error {
                kind: error.kind(),
                terminal: true,
            };
        }
        self.log_transition(from);
        self.pending_attempt = 0;
        self.message = format!("{error}; restart required");
        self.publish_status();
    }

    // ── Streaming ────────────────────────────────────────────────

    async fn handle_publish(&mut self, unit: EncodedUnit) {
        if !self.state.is_streaming() {
            trace!(frame = unit.frame_number, "unit dropped: not streaming");
            return;
        }
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let bytes = unit.data.len() as u64;
        self.stats.record_attempt();
        match client.send(&unit).await {
            Ok(()) => {
                self.stats.record_success(bytes);
                self.meter.record_at(Instant::now(), bytes);
                if self.send_failing {
                    debug!("publishing recovered");
                    self.send_failing = false;
                }
            }
            Err(e) => {
                self.stats.record_failure();
                if !self.send_failing {
                    warn!("publish failed: {e}");
                    self.send_failing = true;
                }
            }
        }
    }

    fn start_monitors(&mut self) {
        let health = self.tuning.health_check_interval;
        let stats = self.tuning.stats_interval;
        self.spawn_ticker("health", health, || ConnectionMessage::HealthTick);
        self.spawn_ticker("stats", stats, || ConnectionMessage::StatsTick);
    }

    fn spawn_ticker(
        &mut self,
        name: &'static str,
        period: std::time::Duration,
        make: fn() -> ConnectionMessage,
    ) {
        let mailbox = self.mailbox.clone();
        self.tasks.spawn(name, move |token| async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(tx) = mailbox.upgrade() else { break };
                        if tx.send(make()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn check_health(&mut self) {
        if !self.state.is_streaming() || self.lost_fired {
            return;
        }
        let alive = match self.client.as_mut() {
            Some(client) => client.is_alive().await,
            None => false,
        };
        let (attempted, succeeded) = (self.stats.attempted(), self.stats.succeeded());
        let stalled = attempted > self.last_poll.0 && succeeded == self.last_poll.1;
        self.last_poll = (attempted, succeeded);

        if alive && !stalled {
            if self.health_failures > 0 {
                info!("link healthy again");
            }
            self.health_failures = 0;
            return;
        }

        self.health_failures += 1;
        warn!(
            failures = self.health_failures,
            max = self.tuning.max_connection_failures,
            alive,
            stalled,
            "health check failed"
        );
        if self.health_failures >= self.tuning.max_connection_failures {
            self.handle_connection_lost().await;
        }
    }

    async fn refresh_stats(&mut self) {
        if !self.state.is_streaming() {
            return;
        }
        if let Some(client) = self.client.as_mut() {
            match time::timeout(self.tuning.round_trip_timeout, client.round_trip()).await {
                Ok(Some(Ok(rtt))) => self.meter.record_rtt(rtt),
                Ok(Some(Err(e))) => debug!("latency probe failed: {e}"),
                Ok(None) => {}
                Err(_) => debug!("latency probe timed out"),
            }
        }

        let now = Instant::now();
        let latency = self.meter.latency();
        self.stats.set_fps(self.meter.frames_per_sec(now));
        self.stats.set_latency(latency);
        self.stats.set_quality(ConnectionQuality::assess(
            self.stats.attempted(),
            self.stats.succeeded(),
            latency,
        ));
        self.publish_status();

        self.stats_ticks += 1;
        if self.stats_ticks % SUMMARY_EVERY == 0 {
            let s = self.stats.snapshot();
            debug!(
                sent = s.frames_succeeded,
                failed = s.frames_failed,
                fps = s.current_fps,
                kbps = self.meter.bytes_per_sec(now) * 8 / 1000,
                quality = %s.connection_quality,
                "stream summary"
            );
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn transition(
        &mut self,
        apply: fn(&mut ConnectionState) -> Result<(), StreamError>,
        message: impl Into<String>,
    ) -> Result<(), StreamError> {
        let from = self.state;
        apply(&mut self.state)?;
        self.log_transition(from);
        self.message = message.into();
        self.publish_status();
        Ok(())
    }

    fn log_transition(&self, from: ConnectionState) {
        if from != self.state {
            info!(%from, to = %self.state, "connection state changed");
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(StreamStatus {
            state: self.state,
            message: self.message.clone(),
            stats: self.stats.snapshot(),
            encoder: self.encoder.snapshot(),
            reconnect_attempt: self.pending_attempt,
            connection_losses: self.connection_losses,
        });
    }
}

/// Close publish and connection, logging instead of failing.
async fn close_quietly(mut client: Box<dyn ProtocolClient>) {
    if let Err(e) = client.close_publish().await {
        debug!("close publish: {e}");
    }
    if let Err(e) = client.close().await {
        debug!("close connection: {e}");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        /// Connect calls that fail before one succeeds.
        connect_failures: u32,
        connect_hangs: bool,
        reject_key: bool,
        /// `is_alive` answer.
        dead: bool,
        send_fails: bool,
        connects: u32,
        alive_checks: u32,
        sent: u32,
        closes: u32,
    }

    type Shared = Arc<Mutex<Script>>;

    struct MockClient(Shared);

    #[async_trait]
    impl ProtocolClient for MockClient {
        async fn connect(&mut self, _url: &IngestUrl) -> Result<(), StreamError> {
            let hang = {
                let mut s = self.0.lock().unwrap();
                s.connects += 1;
                if s.connect_failures > 0 {
                    s.connect_failures -= 1;
                    return Err(StreamError::Network("refused".into()));
                }
                s.connect_hangs
            };
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn publish(&mut self, _key: &str) -> Result<(), StreamError> {
            if self.0.lock().unwrap().reject_key {
                return Err(StreamError::Authentication("bad key".into()));
            }
            Ok(())
        }

        async fn is_alive(&mut self) -> bool {
            let mut s = self.0.lock().unwrap();
            s.alive_checks += 1;
            !s.dead
        }

        async fn send(&mut self, _unit: &EncodedUnit) -> Result<(), StreamError> {
            let mut s = self.0.lock().unwrap();
            if s.send_fails {
                return Err(StreamError::Network("broken pipe".into()));
            }
            s.sent += 1;
            Ok(())
        }

        async fn close_publish(&mut self) -> Result<(), StreamError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.0.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    fn handle_with(script: &Shared, tuning: ConnectionTuning) -> ConnectionHandle {
        let shared = script.clone();
        let factory: SharedClientFactory = Arc::new(move || {
            Box::new(MockClient(shared.clone())) as Box<dyn ProtocolClient>
        });
        ConnectionHandle::spawn(
            factory,
            tuning,
            Arc::new(TransmissionStats::default()),
            Arc::new(EncoderHealth::default()),
        )
    }

    fn handle(script: &Shared) -> ConnectionHandle {
        handle_with(script, ConnectionTuning::default())
    }

    fn settings() -> Settings {
        Settings {
            rtmp_url: "rtmp://ingest.local/live".into(),
            stream_key: " live_abc\u{200B}\n".into(),
            ..Default::default()
        }
    }

    fn unit() -> EncodedUnit {
        EncodedUnit {
            frame_number: 1,
            pts: Duration::ZERO,
            duration: Duration::from_millis(33),
            keyframe: true,
            width: 1280,
            height: 720,
            data: Bytes::from_static(&[0u8; 64]),
        }
    }

    async fn wait_for_state(
        handle: &ConnectionHandle,
        pred: impl FnMut(&StreamStatus) -> bool,
    ) -> StreamStatus {
        let mut rx = handle.subscribe();
        let status = rx.wait_for(pred).await.unwrap().clone();
        status
    }

    #[tokio::test(start_paused = true)]
    async fn non_rtmp_url_is_a_configuration_error() {
        let script = Shared::default();
        let h = handle(&script);
        let err = h
            .start(Settings {
                rtmp_url: "http://ingest.local/live".into(),
                ..settings()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(h.status().state, ConnectionState::Idle);
        assert_eq!(script.lock().unwrap().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_key_is_a_configuration_error() {
        let script = Shared::default();
        let h = handle(&script);
        let err = h
            .start(Settings {
                stream_key: " \u{FEFF} ".into(),
                ..settings()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::MissingStreamKey));
        assert!(h.status().state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn start_publish_stop() {
        let script = Shared::default();
        let h = handle(&script);
        h.start(settings()).await.unwrap();
        assert_eq!(h.status().state, ConnectionState::Streaming);
        assert!(matches!(
            h.start(settings()).await,
            Err(StreamError::AlreadyActive(_))
        ));

        h.publish(unit()).await.unwrap();
        h.publish(unit()).await.unwrap();
        h.stop().await.unwrap();

        let status = h.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.stats.frames_succeeded, 2);
        assert_eq!(status.stats.bytes_sent, 128);
        let s = script.lock().unwrap();
        assert_eq!(s.sent, 2);
        assert_eq!(s.closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_noop() {
        let script = Shared::default();
        let h = handle(&script);
        let before = h.status();
        h.stop().await.unwrap();
        h.stop().await.unwrap();
        assert_eq!(h.status(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reject_is_authentication_and_schedules_one_reconnect() {
        let script = Arc::new(Mutex::new(Script {
            dead: true,
            ..Default::default()
        }));
        let h = handle(&script);
        let err = h.start(settings()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let status = h.status();
        assert_eq!(
            status.state,
            ConnectionState::Error {
                kind: ErrorKind::Authentication,
                terminal: false
            }
        );
        assert_eq!(status.reconnect_attempt, 1);
        assert!(status.message.contains("attempt 1/2"));
        assert_eq!(script.lock().unwrap().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_are_bounded_with_growing_backoff() {
        let script = Arc::new(Mutex::new(Script {
            dead: true,
            ..Default::default()
        }));
        let h = handle(&script);
        let started = time::Instant::now();
        let _ = h.start(settings()).await;

        let status = wait_for_state(&h, |s| {
            matches!(s.state, ConnectionState::Error { terminal: true, .. })
        })
        .await;
        // 8 s then 11 s of backoff, plus verify delays.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(19), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(21), "{elapsed:?}");
        assert_eq!(status.message, "authentication failed — verify stream key");

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(script.lock().unwrap().connects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_key_rejection_is_authentication() {
        let script = Arc::new(Mutex::new(Script {
            reject_key: true,
            ..Default::default()
        }));
        let h = handle(&script);
        let err = h
            .start(Settings {
                auto_reconnect: false,
                ..settings()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Authentication(_)));
        assert_eq!(
            h.status().state,
            ConnectionState::Error {
                kind: ErrorKind::Authentication,
                terminal: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_a_network_error() {
        let script = Arc::new(Mutex::new(Script {
            connect_hangs: true,
            ..Default::default()
        }));
        let h = handle(&script);
        let started = time::Instant::now();
        let err = h
            .start(Settings {
                auto_reconnect: false,
                ..settings()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Timeout(d) if d == Duration::from_secs(8)));
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert_eq!(
            h.status().state,
            ConnectionState::Error {
                kind: ErrorKind::Network,
                terminal: true
            }
        );
        assert!(h.status().message.ends_with("restart required"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_recovers_the_session() {
        let script = Arc::new(Mutex::new(Script {
            connect_failures: 1,
            ..Default::default()
        }));
        let h = handle(&script);
        assert!(h.start(settings()).await.is_err());
        let status = wait_for_state(&h, |s| s.state.is_streaming()).await;
        assert_eq!(status.reconnect_attempt, 0);
        assert_eq!(script.lock().unwrap().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let script = Arc::new(Mutex::new(Script {
            connect_failures: 10,
            ..Default::default()
        }));
        let h = handle(&script);
        assert!(h.start(settings()).await.is_err());
        h.stop().await.unwrap();
        assert!(h.status().state.is_idle());

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(script.lock().unwrap().connects, 1);
        assert!(h.status().state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn start_recovers_from_terminal_error() {
        let script = Arc::new(Mutex::new(Script {
            connect_failures: 1,
            ..Default::default()
        }));
        let h = handle(&script);
        let no_retry = Settings {
            auto_reconnect: false,
            ..settings()
        };
        assert!(h.start(no_retry.clone()).await.is_err());
        assert!(matches!(
            h.status().state,
            ConnectionState::Error { terminal: true, .. }
        ));
        h.start(no_retry).await.unwrap();
        assert!(h.status().state.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_fires_exactly_once() {
        let script = Shared::default();
        let tuning = ConnectionTuning {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        let h = handle_with(&script, tuning);
        h.start(settings()).await.unwrap();
        script.lock().unwrap().dead = true;

        // Six poll intervals: the fifth failure trips the cap.
        time::sleep(Duration::from_secs(15 * 6 + 1)).await;
        let status = h.status();
        assert_eq!(status.connection_losses, 1);
        assert_eq!(
            status.state,
            ConnectionState::Error {
                kind: ErrorKind::Network,
                terminal: true
            }
        );
        // One post-publish check plus five health polls; monitoring stopped.
        assert_eq!(script.lock().unwrap().alive_checks, 6);
        assert_eq!(script.lock().unwrap().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publishing_counts_as_unhealthy() {
        let script = Shared::default();
        let tuning = ConnectionTuning {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        let h = handle_with(&script, tuning);
        h.start(settings()).await.unwrap();
        script.lock().unwrap().send_fails = true;

        for _ in 0..80 {
            h.publish(unit()).await.unwrap();
            time::sleep(Duration::from_secs(1)).await;
        }
        let status = h.status();
        assert_eq!(status.connection_losses, 1);
        assert!(status.stats.frames_failed > 0);
        assert_eq!(status.stats.frames_succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_poll_resets_failures() {
        let script = Shared::default();
        let h = handle(&script);
        h.start(settings()).await.unwrap();

        for _ in 0..3 {
            script.lock().unwrap().dead = true;
            time::sleep(Duration::from_secs(15 * 4 + 1)).await;
            script.lock().unwrap().dead = false;
            time::sleep(Duration::from_secs(15)).await;
        }
        let status = h.status();
        assert!(status.state.is_streaming());
        assert_eq!(status.connection_losses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_tick_publishes_counters() {
        let script = Shared::default();
        let h = handle(&script);
        h.start(settings()).await.unwrap();
        for _ in 0..10 {
            h.publish(unit()).await.unwrap();
        }
        time::sleep(Duration::from_secs(3)).await;
        let stats = h.status().stats;
        assert_eq!(stats.frames_attempted, 10);
        assert_eq!(stats.frames_succeeded, 10);
        assert_eq!(stats.connection_quality, ConnectionQuality::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_failure_is_terminal() {
        let script = Shared::default();
        let h = handle(&script);
        h.start(settings()).await.unwrap();
        h.report_pipeline_failure(StreamError::Encoder(crate::error::EncoderError::Fatal(
            "device lost".into(),
        )))
        .unwrap();
        let status = wait_for_state(&h, |s| !s.state.is_streaming()).await;
        assert_eq!(
            status.state,
            ConnectionState::Error {
                kind: ErrorKind::Encoder,
                terminal: true
            }
        );
        assert!(status.message.contains("device lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn units_outside_streaming_are_dropped() {
        let script = Shared::default();
        let h = handle(&script);
        h.publish(unit()).await.unwrap();
        h.stop().await.unwrap();
        assert_eq!(h.status().stats.frames_attempted, 0);
        assert_eq!(script.lock().unwrap().sent, 0);
    }
}
