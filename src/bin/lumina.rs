#![forbid(unsafe_code)]

//! `lumina [PORT]`: serves the web UI and the yt-dlp backed download API
//! until Ctrl+C.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lumina_downloader::{
    bootstrap::{self, Installer},
    config::{self, Cli},
    logging,
    server::{self, AppState},
};
use tokio::{net::TcpListener, task};
use tracing::info;

const BROWSER_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let mut config = config::load_server_config(&cli)?;

    if !cli.skip_install {
        let tool = config.tool.clone();
        config.tool = task::spawn_blocking(move || Installer::detect().ensure_tool(tool))
            .await
            .context("yt-dlp setup task failed")??;
    }

    let state = AppState::new(&config)?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;

    let base_url = config.base_url();
    info!("LUMINA media downloader (yt-dlp powered)");
    info!("server running at {base_url}");
    info!("web root: {}", config.www_root.display());
    info!("downloads folder: {}", config.downloads_dir.display());
    info!("API endpoint: {base_url}/api/download");
    info!("press Ctrl+C to stop the server");

    if !cli.no_browser {
        bootstrap::open_browser_later(base_url, BROWSER_DELAY);
    }

    server::run(listener, state, server::shutdown_signal()).await
}
