use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod job;
mod metadata;
mod orchestrator;
mod progress;
mod resolver;
mod store;
mod transcode;

use api::AppState;
use config::Config;
use metadata::MetadataClient;
use orchestrator::Orchestrator;
use store::JobStore;

#[derive(Parser)]
#[command(name = "tubegrab")]
#[command(about = "Download videos with yt-dlp and serve them as MP4")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory downloads are written to and served from
    #[arg(long, env = "TUBEGRAB_DOWNLOAD_FOLDER", default_value = "./downloads", global = true)]
    download_dir: PathBuf,

    /// ffmpeg executable
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg", global = true)]
    ffmpeg: PathBuf,

    /// yt-dlp executable
    #[arg(long = "yt-dlp", env = "YT_DLP_PATH", default_value = "yt-dlp", global = true)]
    ytdlp: PathBuf,

    #[arg(long, env = "TUBEGRAB_HOST", default_value = "127.0.0.1", global = true)]
    host: String,

    #[arg(long, env = "TUBEGRAB_PORT", default_value_t = 5001, global = true)]
    port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,
    /// Download a single URL in the foreground and print the resulting job
    Fetch {
        #[arg(short, long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tubegrab=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::new(&cli.download_dir, cli.ytdlp.clone(), cli.ffmpeg.clone())?);
    info!("Download directory: {}", cfg.download_dir.display());

    match cli.command {
        Some(Commands::Fetch { url }) => fetch(cfg, &url).await,
        Some(Commands::Serve) | None => serve(cfg, &cli.host, cli.port).await,
    }
}

async fn serve(cfg: Arc<Config>, host: &str, port: u16) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(JobStore::new()), Arc::clone(&cfg)));
    let state = AppState {
        orchestrator,
        metadata: MetadataClient::new(cfg.ytdlp_bin.clone())?,
    };

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")
}

async fn fetch(cfg: Arc<Config>, url: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(Arc::new(JobStore::new()), cfg);
    let id = orchestrator.start(url);
    info!("Job {}: started", id);

    let job = orchestrator.wait_for(&id, Duration::from_millis(500)).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    match job.error {
        Some(e) => anyhow::bail!("Job {} failed: {}", id, e),
        None => Ok(()),
    }
}
