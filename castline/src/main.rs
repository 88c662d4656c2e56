//! castline publisher entry point.
//!
//! ```text
//! castline                        Stream to the castline relay at the ingest URL
//! castline --config <path>        Load a custom config TOML
//! castline --gen-config           Write default config to stdout
//! castline --relay 127.0.0.1:1935 Publish to an in-process relay
//! castline --dry-run              Encode without sending anywhere
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use castline::config::CastlineConfig;
use castline::service::{PublisherService, Sink};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "castline", about = "Live-video publisher with reconnect and adaptive quality")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "castline.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Bind an in-process relay at this address and publish to it.
    #[arg(long, value_name = "ADDR", conflicts_with = "dry_run")]
    relay: Option<String>,

    /// Encode frames but discard them instead of connecting.
    #[arg(long)]
    dry_run: bool,

    /// Override the ingest URL. It must point at a castline relay; no
    /// RTMP client is bundled.
    #[arg(long)]
    url: Option<String>,

    /// Override the stream key.
    #[arg(long)]
    key: Option<String>,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", CastlineConfig::default_toml()?);
        return Ok(());
    }

    let mut config = CastlineConfig::load(&cli.config);
    if let Some(url) = cli.url {
        config.stream.rtmp_url = url;
    }
    if let Some(key) = cli.key {
        config.stream.stream_key = key;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let sink = Sink::from_flags(cli.relay, cli.dry_run);

    info!("castline v{}", env!("CARGO_PKG_VERSION"));
    info!("sink: {sink:?}");
    info!(
        "stream: {}x{} @ {} fps, {} kbps",
        config.stream.video_width,
        config.stream.video_height,
        config.stream.frame_rate,
        config.stream.video_bitrate_kbps
    );
    info!(
        "source: {:?} {}x{} @ {} fps",
        config.source.format, config.source.width, config.source.height, config.source.fps
    );

    let service = PublisherService::new(config, sink, cli.duration.map(Duration::from_secs));
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
