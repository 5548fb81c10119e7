//! Server thread
//!
//! Runs the broker side of the lifecycle: announce `initialized`, wait for the
//! surface owner's startup request, set up segments and the transport, serve
//! until shutdown is requested, then tear everything down in order.

use crate::config::Config;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::{BrokerError, BrokerResult};
use crate::launcher::{launch_all, ProcessLauncher};
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState, Side};
use crate::render::{Renderer, Surface};
use crate::shm::{RegionManager, PARAMS_SEGMENT, TEXTURE_SEGMENT};
use crate::transport::{self, Transport};
use anyhow::{Context, Result};
use glaze_proto::TransportMode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything the server thread needs from the configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub transport: TransportMode,
    pub socket_path: PathBuf,
    pub poll_interval: Duration,
    pub io_timeout: Duration,
    pub log_transfers: bool,
    pub page_size: usize,
    pub parameter_capacity: usize,
    pub clients: Vec<PathBuf>,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transport: config.server.transport,
            socket_path: config.server.socket_path(),
            poll_interval: config.server.poll_interval(),
            io_timeout: config.server.io_timeout(),
            log_transfers: config.server.log_transfers,
            page_size: config.table.page_size,
            parameter_capacity: config.shared_memory.parameter_capacity,
            clients: config.launcher.clients.clone(),
        }
    }
}

/// State that exists between startup and shutdown
struct Running {
    surface: Surface,
    regions: RegionManager,
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher,
}

/// Body of the server thread
pub fn run(
    settings: ServerSettings,
    lifecycle: Arc<Lifecycle>,
    mut renderer: Box<dyn Renderer>,
    mut launcher: Box<dyn ProcessLauncher>,
) -> Result<()> {
    lifecycle.advance(Side::Server, LifecycleState::Initialized)?;
    match lifecycle.wait_for(LifecycleState::RequestStartup) {
        Ok(()) => {}
        Err(LifecycleError::Aborted(reason)) => {
            info!("Server stopped before startup: {}", reason);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }
    lifecycle.advance(Side::Server, LifecycleState::ResponseStartingUp)?;

    let mut running = match start(&settings, &lifecycle) {
        Ok(running) => running,
        Err(e) => {
            lifecycle.abort(format!("startup failed: {e:#}"));
            return Err(e);
        }
    };
    lifecycle.advance(Side::Server, LifecycleState::ResponseStartedUp)?;
    info!(
        "Serving on {:?} ({} transport, surface {}x{})",
        running.transport.socket_path(),
        running.transport.mode(),
        running.surface.width,
        running.surface.height
    );

    let launched = launch_all(launcher.as_mut(), &settings.clients);
    if launched > 0 {
        info!("Launched {} of {} clients", launched, settings.clients.len());
    }

    let served = serve(&mut running, &lifecycle, renderer.as_mut(), launcher.as_mut());
    if let Err(e) = &served {
        error!("Server failed: {}", e);
        lifecycle.abort(e.to_string());
    } else {
        lifecycle.advance(Side::Server, LifecycleState::ResponseShuttingDown)?;
    }

    shutdown(running, renderer.as_mut());
    drop(launcher);

    served?;
    lifecycle.advance(Side::Server, LifecycleState::ResponseShutdown)?;
    debug!("Lifecycle history: {:?}", lifecycle.history());
    info!("Server shut down");
    Ok(())
}

fn start(settings: &ServerSettings, lifecycle: &Arc<Lifecycle>) -> Result<Running> {
    let (width, height) = lifecycle
        .surface_size()
        .context("Startup requested without a surface size")?;
    let surface = Surface { width, height };

    let mut regions = RegionManager::new();
    regions
        .allocate(TEXTURE_SEGMENT, surface.texture_capacity())
        .context("Failed to allocate texture segment")?;
    regions
        .allocate(PARAMS_SEGMENT, settings.parameter_capacity)
        .context("Failed to allocate parameters segment")?;

    let transport = transport::bind(
        settings.transport,
        &settings.socket_path,
        settings.poll_interval,
        settings.io_timeout,
    )
    .with_context(|| format!("Failed to bind {:?}", settings.socket_path))?;

    let dispatcher = Dispatcher::new(
        DispatchConfig {
            page_size: settings.page_size,
            socket_path: settings.socket_path.clone(),
            poll_interval: settings.poll_interval,
            log_transfers: settings.log_transfers,
        },
        lifecycle.clone(),
    );

    Ok(Running {
        surface,
        regions,
        transport,
        dispatcher,
    })
}

fn serve(
    running: &mut Running,
    lifecycle: &Lifecycle,
    renderer: &mut dyn Renderer,
    launcher: &mut dyn ProcessLauncher,
) -> BrokerResult<()> {
    let Running {
        surface,
        regions,
        transport,
        dispatcher,
    } = running;

    while !lifecycle.shutdown_requested() {
        dispatcher.reap_connections();
        launcher.reap();

        match transport.receive(regions) {
            Ok(Some(message)) => {
                let result = dispatcher.dispatch(message, transport.as_mut(), regions, renderer);
                transport.release(regions);
                if let Err(e) = result {
                    recover(e)?;
                }
            }
            Ok(None) => {}
            Err(e) => {
                transport.release(regions);
                recover(e)?;
            }
        }

        dispatcher.redraw(renderer, surface.size());
    }
    Ok(())
}

/// Log a failed step, or hand it back if the server cannot continue
fn recover(err: BrokerError) -> BrokerResult<()> {
    if err.is_fatal() {
        return Err(err);
    }
    match &err {
        BrokerError::Transport(e) => debug!("Transport: {}", e),
        _ => warn!("Dropped message: {}", err),
    }
    Ok(())
}

fn shutdown(running: Running, renderer: &mut dyn Renderer) {
    let Running {
        mut regions,
        transport,
        mut dispatcher,
        ..
    } = running;

    let windows = dispatcher.windows().len();
    let connections = dispatcher.connection_count();
    dispatcher.teardown(renderer);
    drop(transport);
    regions.release_all();
    info!(
        "Released {} windows and {} connections",
        windows, connections
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PlatformBridge;
    use crate::render::testing::{RecordingRenderer, RenderCall};
    use crate::render::HeadlessSurfaceProvider;
    use glaze_client::{Client, KeepAliveClient, ShmSession};
    use glaze_proto::Rect;
    use std::path::Path;
    use std::time::Instant;

    struct NoLauncher;

    impl ProcessLauncher for NoLauncher {
        fn launch(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn reap(&mut self) -> usize {
            0
        }
    }

    fn settings(dir: &Path, transport: TransportMode) -> ServerSettings {
        ServerSettings {
            transport,
            socket_path: dir.join("glaze.sock"),
            poll_interval: Duration::from_millis(5),
            io_timeout: Duration::from_secs(2),
            log_transfers: true,
            page_size: 4,
            parameter_capacity: 1024,
            clients: Vec::new(),
        }
    }

    fn start_bridge(
        settings: ServerSettings,
        renderer: RecordingRenderer,
    ) -> (PlatformBridge, Arc<Lifecycle>) {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(16, 16)),
        );
        bridge
            .start(move |lifecycle| run(settings, lifecycle, Box::new(renderer), Box::new(NoLauncher)))
            .unwrap();
        bridge.set_surface(true).unwrap();
        (bridge, lifecycle)
    }

    fn wait_for_frame(renderer: &RecordingRenderer, draws: usize) -> Vec<RenderCall> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let frame = renderer.last_frame();
            let drawn = frame
                .iter()
                .filter(|call| matches!(call, RenderCall::Draw { .. }))
                .count();
            if frame.last() == Some(&RenderCall::Swap) && drawn == draws {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame with {draws} draws");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_socket_transport_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), TransportMode::Socket);
        let client = Client::new(&settings.socket_path);
        let renderer = RecordingRenderer::default();
        let (mut bridge, lifecycle) = start_bridge(settings, renderer.clone());

        assert_eq!(client.new_window(Rect::new(0, 0, 100, 100)).unwrap(), 0);
        client.modify_window(0, Rect::new(10, 10, 50, 50)).unwrap();
        client.close_window(0).unwrap();
        assert_eq!(client.new_window(Rect::new(5, 5, 2, 2)).unwrap(), 0);
        client.texture(0, 2, 2, &[255u8; 16]).unwrap();

        let frame = wait_for_frame(&renderer, 1);
        assert!(matches!(
            frame[1],
            RenderCall::Draw {
                dst: Rect { x: 5, y: 5, w: 2, h: 2 },
                ..
            }
        ));

        // Malformed textures are dropped and the server keeps going.
        client.texture(0, 2, 2, &[0u8; 3]).unwrap();
        assert_eq!(client.new_window(Rect::new(0, 0, 1, 1)).unwrap(), 1);

        bridge.set_surface(false).unwrap();
        bridge.stop().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::ResponseShutdown);
        assert!(!dir.path().join("glaze.sock").exists());
    }

    #[test]
    fn test_shared_memory_transport_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), TransportMode::SharedMemory);
        let socket = settings.socket_path.clone();
        let renderer = RecordingRenderer::default();
        let (mut bridge, _lifecycle) = start_bridge(settings, renderer.clone());

        let mut session = ShmSession::connect(Client::new(&socket)).unwrap();
        assert_eq!(session.new_window(Rect::new(0, 0, 4, 4)).unwrap(), 0);
        assert_eq!(session.new_window(Rect::new(4, 4, 4, 4)).unwrap(), 1);
        session.texture(1, 4, 4, &[7u8; 64]).unwrap();
        session.modify_window(0, Rect::new(1, 1, 2, 2)).unwrap();

        let frame = wait_for_frame(&renderer, 2);
        assert_eq!(frame.first(), Some(&RenderCall::Clear));
        assert_eq!(renderer.uploads(), 1);

        session.close_window(1).unwrap();
        wait_for_frame(&renderer, 1);

        let record = session.new_connection().unwrap();
        let keepalive = KeepAliveClient::connect(&record.keepalive_path().unwrap()).unwrap();
        keepalive.ping().unwrap();

        bridge.stop().unwrap();
    }

    #[test]
    fn test_bind_failure_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), TransportMode::Socket);
        settings.socket_path = dir.path().join("missing").join("x").join("glaze.sock");
        // Parent path component is a file, so binding cannot succeed.
        std::fs::write(dir.path().join("missing"), b"").unwrap();

        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(8, 8)),
        );
        bridge
            .start(move |lifecycle| {
                run(
                    settings,
                    lifecycle,
                    Box::new(RecordingRenderer::default()),
                    Box::new(NoLauncher),
                )
            })
            .unwrap();

        assert!(bridge.set_surface(true).is_err());
        assert!(bridge.stop().is_err());
    }

    #[test]
    fn test_stop_before_surface_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), TransportMode::Socket);
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(8, 8)),
        );
        bridge
            .start(move |lifecycle| {
                run(
                    settings,
                    lifecycle,
                    Box::new(RecordingRenderer::default()),
                    Box::new(NoLauncher),
                )
            })
            .unwrap();
        lifecycle.wait_for(LifecycleState::Initialized).unwrap();
        bridge.stop().unwrap();
    }
}
