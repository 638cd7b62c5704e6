//! # tally-agent
//!
//! tally server binary. Loads settings, starts the HTTP/WebSocket server and
//! the heartbeat monitor, and drains connections on Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tally_core::logging::{LogFormat, init_subscriber};
use tally_server::config::ServerConfig;
use tally_server::metrics::{PrometheusSink, install_recorder};
use tally_server::server::TallyServer;
use tally_settings::TallySettings;

/// Resumable WebSocket counter server.
#[derive(Parser, Debug)]
#[command(name = "tally", about = "Resumable WebSocket counter server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.tally/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or `EnvFilter` directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Load layered settings, then apply command-line overrides.
    fn load_settings(&self) -> Result<TallySettings> {
        let mut settings = match self.settings {
            Some(ref path) => tally_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => tally_settings::load_settings().with_context(|| {
                format!(
                    "Failed to load settings from {}",
                    tally_settings::settings_path().display()
                )
            })?,
        };

        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics_handle = install_recorder().context("Failed to install metrics recorder")?;

    let config = ServerConfig::from(&settings.server);
    let server =
        TallyServer::new(config, Arc::new(PrometheusSink)).with_metrics_handle(metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    let heartbeat = server.spawn_heartbeat();

    tracing::info!(
        "tally listening on http://{addr} (heartbeat every {:?}, session ttl {:?})",
        server.config().heartbeat_interval,
        server.config().session_ttl
    );

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    let report = server.shutdown_gracefully(vec![handle, heartbeat]).await;

    tracing::info!(
        drained = report.attempted,
        force_closed = report.force_closed,
        failed = report.failed,
        "Shutdown complete"
    );
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}
