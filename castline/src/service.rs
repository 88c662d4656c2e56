//! Publisher service core logic.
//!
//! Drives one streaming session: starts the streamer, feeds it the
//! test pattern at the source frame rate, prints status changes and
//! shuts down on Ctrl-C, after the optional duration, or when the
//! session fails for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

use castline_core::{
    ConnectionState, ErrorKind, NullClient, ProtocolClient, RelayClient, RelayConfig,
    RelayServer, SharedClientFactory, StreamStatus, Streamer, settings::sanitize_stream_key,
};

use crate::config::CastlineConfig;
use crate::pattern::TestPattern;

/// Stream key for local sinks when the config has none.
const LOCAL_KEY: &str = "castline";

/// Where encoded media goes.
///
/// The only bundled protocol client speaks the castline relay framing,
/// not RTMP, so the `rtmp://` URL must point at a castline relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// A castline relay elsewhere, at the ingest URL from the settings.
    RemoteRelay,
    /// An in-process relay bound to this address.
    LocalRelay(String),
    /// Nowhere; everything is accepted and discarded.
    DryRun,
}

impl Sink {
    /// Sink chosen by the `--relay` / `--dry-run` flags.
    pub fn from_flags(relay: Option<String>, dry_run: bool) -> Self {
        match (relay, dry_run) {
            (Some(addr), _) => Sink::LocalRelay(addr),
            (None, true) => Sink::DryRun,
            (None, false) => Sink::RemoteRelay,
        }
    }
}

pub struct PublisherService {
    config: CastlineConfig,
    sink: Sink,
    duration: Option<Duration>,
    running: Arc<AtomicBool>,
}

impl PublisherService {
    pub fn new(config: CastlineConfig, sink: Sink, duration: Option<Duration>) -> Self {
        Self {
            config,
            sink,
            duration,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until stopped, the duration elapses, or the session fails
    /// with no reconnect pending.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let mut settings = self.config.stream.clone();
        if self.sink != Sink::RemoteRelay && settings.stream_key.is_empty() {
            settings.stream_key = LOCAL_KEY.into();
        }
        if self.sink == Sink::DryRun && settings.rtmp_url.is_empty() {
            settings.rtmp_url = "rtmp://localhost/dry-run".into();
        }

        // Kept alive for the whole run.
        let _relay = match &self.sink {
            Sink::LocalRelay(addr) => {
                let relay = RelayServer::bind(
                    addr,
                    RelayConfig {
                        allowed_keys: vec![sanitize_stream_key(&settings.stream_key)],
                        silent_reject: false,
                    },
                )
                .await?;
                settings.rtmp_url = relay.ingest_url("live");
                info!("local relay on {}", relay.local_addr());
                Some(relay)
            }
            Sink::RemoteRelay => {
                warn!(
                    url = %settings.rtmp_url,
                    "no RTMP client is bundled; the ingest URL must be a castline relay"
                );
                None
            }
            Sink::DryRun => None,
        };

        let clients: SharedClientFactory = match self.sink {
            Sink::DryRun => Arc::new(|| Box::new(NullClient::new()) as Box<dyn ProtocolClient>),
            _ => Arc::new(|| Box::new(RelayClient::new()) as Box<dyn ProtocolClient>),
        };
        let mut streamer =
            Streamer::with_software_encoder(clients, self.config.streamer_options());

        match streamer.start(settings).await {
            Ok(()) => info!("streaming"),
            Err(e) if e.kind() == ErrorKind::Configuration => return Err(e.into()),
            Err(e) => warn!("first connection attempt failed: {e}"),
        }

        let result = self.pump(&streamer).await;
        streamer.stop().await?;
        print_status(&streamer.status());
        self.running.store(false, Ordering::SeqCst);
        info!("publisher stopped");
        result
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Feed frames and report status until something ends the run.
    async fn pump(&self, streamer: &Streamer) -> Result<(), Box<dyn std::error::Error>> {
        let source = &self.config.source;
        let mut pattern = TestPattern::new(source.format, source.width, source.height);
        let period = Duration::from_secs(1) / source.fps.max(1);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let deadline = self.duration.map(|d| tokio::time::Instant::now() + d);
        let mut status = streamer.subscribe();
        let mut last = status.borrow_and_update().clone();
        print_status(&last);

        loop {
            tokio::select! {
                _ = ticker.tick() => streamer.submit_frame(pattern.next_frame()),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err("streamer status channel closed".into());
                    }
                    let current = status.borrow_and_update().clone();
                    if current.state != last.state || current.message != last.message {
                        print_status(&current);
                    }
                    if let ConnectionState::Error { terminal: true, .. } = current.state {
                        error!("{}", current.message);
                        return Err(current.message.into());
                    }
                    last = current;
                }
                _ = sleep_until(deadline) => {
                    info!("duration elapsed");
                    return Ok(());
                }
                _ = Self::wait_for_stop(&self.running) => return Ok(()),
            }
        }
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One JSON line per status change on stdout.
fn print_status(status: &StreamStatus) {
    match serde_json::to_string(status) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("cannot serialize status: {e}"),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use castline_core::PixelFormat;

    fn config() -> CastlineConfig {
        let mut cfg = CastlineConfig::default();
        cfg.stream.rtmp_url = "rtmp://unused/live".into();
        cfg.stream.stream_key = "key".into();
        cfg.stream.video_width = 320;
        cfg.stream.video_height = 180;
        cfg.source.width = 320;
        cfg.source.height = 180;
        cfg.source.format = PixelFormat::I420;
        cfg
    }

    #[test]
    fn service_creates_stopped() {
        let svc = PublisherService::new(config(), Sink::DryRun, None);
        assert!(!svc.is_running());
    }

    #[test]
    fn sink_follows_flags() {
        assert_eq!(Sink::from_flags(None, false), Sink::RemoteRelay);
        assert_eq!(Sink::from_flags(None, true), Sink::DryRun);
        assert_eq!(
            Sink::from_flags(Some("127.0.0.1:1935".into()), false),
            Sink::LocalRelay("127.0.0.1:1935".into())
        );
    }

    #[tokio::test]
    async fn remote_relay_reaches_a_relay_at_the_ingest_url() {
        let relay = RelayServer::bind(
            "127.0.0.1:0",
            RelayConfig {
                allowed_keys: vec!["key".into()],
                silent_reject: false,
            },
        )
        .await
        .unwrap();
        let mut cfg = config();
        cfg.stream.rtmp_url = relay.ingest_url("live");
        let svc = PublisherService::new(cfg, Sink::RemoteRelay, Some(Duration::from_millis(600)));
        svc.run().await.unwrap();
        assert_eq!(relay.snapshot().sessions, 1);
    }

    #[test]
    fn stop_handle_works() {
        let svc = PublisherService::new(config(), Sink::DryRun, None);
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn dry_run_for_a_duration() {
        let svc = PublisherService::new(
            config(),
            Sink::DryRun,
            Some(Duration::from_millis(600)),
        );
        svc.run().await.unwrap();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn local_relay_for_a_duration() {
        let svc = PublisherService::new(
            config(),
            Sink::LocalRelay("127.0.0.1:0".into()),
            Some(Duration::from_millis(600)),
        );
        svc.run().await.unwrap();
    }

    #[tokio::test]
    async fn dry_run_needs_no_credentials() {
        let mut cfg = config();
        cfg.stream.rtmp_url.clear();
        cfg.stream.stream_key.clear();
        let svc = PublisherService::new(cfg, Sink::DryRun, Some(Duration::from_millis(300)));
        svc.run().await.unwrap();
    }

    #[tokio::test]
    async fn configuration_errors_end_the_run() {
        let mut cfg = config();
        cfg.stream.stream_key = "   ".into();
        let svc = PublisherService::new(cfg, Sink::DryRun, None);
        assert!(svc.run().await.is_err());
    }
}
