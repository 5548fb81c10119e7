//! Glaze - minimal display compositor broker
//!
//! Clients connect over a Unix socket (or a pair of shared-memory segments),
//! create windows, upload textures and the broker composites them onto a
//! single surface owned by the host.

mod bridge;
mod config;
mod dispatch;
mod error;
mod keepalive;
mod launcher;
mod lifecycle;
mod render;
mod server;
mod shm;
mod table;
mod transport;
mod window;

use anyhow::{anyhow, bail, Context, Result};
use bridge::PlatformBridge;
use config::Config;
use glaze_proto::TransportMode;
use launcher::CommandLauncher;
use lifecycle::Lifecycle;
use render::{HeadlessRenderer, HeadlessSurfaceProvider};
use server::ServerSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line overrides
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    transport: Option<TransportMode>,
    socket: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("{} requires a value", name))
            };
            match arg.as_str() {
                "--config" | "-c" => parsed.config = Some(PathBuf::from(value("--config")?)),
                "--transport" | "-t" => {
                    let mode = value("--transport")?;
                    parsed.transport = Some(mode.parse().map_err(|e: String| anyhow!(e))?);
                }
                "--socket" | "-s" => parsed.socket = Some(PathBuf::from(value("--socket")?)),
                other => bail!("Unknown argument {:?}", other),
            }
        }
        Ok(parsed)
    }

    fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.transport {
            config.server.transport = mode;
        }
        if let Some(socket) = &self.socket {
            config.server.socket_path = Some(socket.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "glaze=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Glaze compositor broker");

    let args = Args::parse(std::env::args().skip(1))?;
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().context("Failed to load configuration")?,
    };
    args.apply(&mut config);
    config.validate()?;

    let settings = ServerSettings::from_config(&config);
    info!(
        "Transport {} on {:?}",
        settings.transport, settings.socket_path
    );

    let lifecycle = Arc::new(Lifecycle::new());
    let mut bridge = PlatformBridge::new(
        lifecycle,
        Box::new(HeadlessSurfaceProvider::new(
            config.surface.width,
            config.surface.height,
        )),
    );

    // Fires when the server thread returns for any reason
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
    let launcher = CommandLauncher::new(settings.socket_path.clone(), settings.transport);
    bridge.start(move |lifecycle| {
        let result = server::run(
            settings,
            lifecycle,
            Box::new(HeadlessRenderer::new()),
            Box::new(launcher),
        );
        let _ = done_tx.send(());
        result
    })?;

    let (mut bridge, attached) = tokio::task::spawn_blocking(move || {
        let result = bridge.set_surface(true);
        (bridge, result)
    })
    .await
    .context("Surface attach task failed")?;

    if let Err(e) = attached {
        error!("Startup failed: {:#}", e);
        return tokio::task::spawn_blocking(move || bridge.stop())
            .await
            .context("Shutdown task failed")?
            .and(Err(e));
    }

    // Handle SIGTERM and SIGINT
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = &mut done_rx => info!("Server stopped on its own"),
        }
    }

    let result = tokio::task::spawn_blocking(move || bridge.stop())
        .await
        .context("Shutdown task failed")?;
    if let Err(e) = &result {
        error!("Server error: {:#}", e);
    } else {
        info!("Shutdown complete");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_overrides() {
        let parsed = args(&["--transport", "shared_memory", "--socket", "/tmp/g.sock"]).unwrap();
        assert_eq!(parsed.transport, Some(TransportMode::SharedMemory));

        let mut config = Config::default();
        parsed.apply(&mut config);
        assert_eq!(config.server.transport, TransportMode::SharedMemory);
        assert_eq!(config.server.socket_path(), PathBuf::from("/tmp/g.sock"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(args(&["--transport", "carrier-pigeon"]).is_err());
        assert!(args(&["--socket"]).is_err());
        assert!(args(&["--frobnicate"]).is_err());
    }
}
