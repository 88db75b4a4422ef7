//! deskstream loopback: entry point.
//!
//! ```text
//! deskstream-loopback                  Run with deskstream-loopback.toml or defaults
//! deskstream-loopback --config <path>  Load a custom config TOML
//! deskstream-loopback --gen-config     Write default config to stdout
//! deskstream-loopback --duration 30    Override the session length (0 = until Ctrl-C)
//! deskstream-loopback --fps 30         Override the display refresh rate
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskstream_loopback::config::LoopbackConfig;
use deskstream_loopback::service::LoopbackSession;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "deskstream-loopback", about = "Host and client streaming pipelines over an in-memory link")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "deskstream-loopback.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Session length in seconds; 0 runs until Ctrl-C.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Display refresh rate of the synthetic host.
    #[arg(long)]
    fps: Option<u32>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&LoopbackConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = LoopbackConfig::load(&cli.config);
    if let Some(secs) = cli.duration {
        config.session.duration_secs = secs;
    }
    if let Some(fps) = cli.fps {
        config.display.refresh_rate = fps;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("deskstream-loopback v{}", env!("CARGO_PKG_VERSION"));
    info!("display: {}", config.display_mode());
    info!("codec preferences: {:?}", config.codec.preferences);
    match config.duration() {
        Some(d) => info!("duration: {}s", d.as_secs()),
        None => info!("duration: until Ctrl-C"),
    }

    let session = LoopbackSession::new(config);
    let stop = session.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let summary = session.run().await?;

    info!(
        end = ?summary.end,
        codec = ?summary.codec,
        mode = %summary.final_mode,
        encoded = summary.frames_encoded,
        delivered = summary.frames_delivered,
        wire_kb = summary.bytes_on_wire / 1024,
        keyframe_requests = summary.keyframe_requests,
        client_resets = summary.client_resets,
        renegotiations = summary.renegotiations,
        hard_restarts = summary.hard_restarts,
        "session finished"
    );
    info!(
        fps = format!("{:.1}", summary.stats.fps),
        latency_ms = format!("{:.1}", summary.stats.latency_ms),
        dropped = summary.stats.dropped_frames,
        "last client stats"
    );
    Ok(())
}
