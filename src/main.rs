use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

// live-streamer
//
// Startup order:
//   - Load and validate config.json (inputs, ingest, transcode profile)
//   - Find ffmpeg and expand the inputs into the initial playlist
//   - Start the control surfaces (HTTP/WebSocket, stdin console, dir watcher)
//   - Run the play loop until something calls close()

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use live_streamer::{
    config::{Config, DEFAULT_CONFIG_PATH},
    console,
    ffmpeg::{locate_ffmpeg, FfmpegLauncher, FFMPEG_ENV},
    server,
    supervisor::{Supervisor, SupervisorOptions},
    watcher::DirWatcher,
};

#[derive(Parser, Debug)]
#[command(name = "live-streamer", version, about = "Stream a playlist of videos to an RTMP ingest")]
struct Args {
    /// Path to the JSON config file
    #[arg(long, env = "LIVESTREAMER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override `server.addr` from the config
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Disable the stdin console (for running under a service manager)
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let version = env!("CARGO_PKG_VERSION");

    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let ffmpeg = locate_ffmpeg()
        .with_context(|| format!("ffmpeg not found on PATH (set {FFMPEG_ENV} to override)"))?;
    info!("using transcoder {}", ffmpeg.display());

    let items = cfg.resolve_playlist()?;
    info!("playlist has {} item(s), streaming to {}", items.len(), cfg.output.ingest_url());

    let launcher = FfmpegLauncher::new(ffmpeg, cfg.play.clone(), cfg.output.clone());
    let sup = Arc::new(Supervisor::new(items, Arc::new(launcher), SupervisorOptions::from_config(&cfg)));

    let addr: SocketAddr = match args.bind {
        Some(addr) => addr,
        None => cfg.server.addr.parse().with_context(|| format!("invalid server.addr {:?}", cfg.server.addr))?,
    };
    let server_task = {
        let sup = sup.clone();
        let interval = cfg.server.broadcast_interval();
        tokio::spawn(async move {
            if let Err(e) = server::serve(sup.clone(), addr, interval).await {
                warn!("control server failed: {e:#}");
                sup.close().await;
            }
        })
    };

    // Keep the watcher alive for the lifetime of the play loop.
    let _watcher = match cfg.watch_dirs() {
        dirs if dirs.is_empty() => None,
        dirs => match DirWatcher::start(&dirs, sup.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("directory watching disabled: {e:#}");
                None
            }
        },
    };

    if !args.no_console {
        tokio::spawn(console::run(sup.clone()));
    }

    {
        let sup = sup.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            sup.close().await;
        });
    }

    info!("live-streamer {version} starting");
    sup.stream().await;
    sup.close().await;

    if tokio::time::timeout(Duration::from_secs(5), server_task).await.is_err() {
        warn!("control server did not stop in time");
    }
    info!("live-streamer stopped");
    if !args.no_console {
        // The console's blocking stdin read cannot be cancelled and would
        // hold the runtime open until the next newline.
        std::process::exit(0);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
