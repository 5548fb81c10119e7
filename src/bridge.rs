//! Platform bridge
//!
//! Host-side driver of the broker. The host calls `start` once, hands over a
//! surface with `set_surface(true)`, takes it back with `set_surface(false)`,
//! and calls `stop` on exit. Each call blocks until the server thread has
//! answered through the lifecycle.

use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
use crate::render::{Surface, SurfaceProvider};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// How long `set_surface(false)` waits for the server to finish shutting down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PlatformBridge {
    lifecycle: Arc<Lifecycle>,
    surfaces: Box<dyn SurfaceProvider>,
    surface: Option<Surface>,
    server: Option<JoinHandle<Result<()>>>,
    shutdown_timeout: Duration,
}

impl PlatformBridge {
    pub fn new(lifecycle: Arc<Lifecycle>, surfaces: Box<dyn SurfaceProvider>) -> Self {
        Self {
            lifecycle,
            surfaces,
            surface: None,
            server: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    /// Spawn the server thread
    pub fn start<F>(&mut self, server: F) -> Result<()>
    where
        F: FnOnce(Arc<Lifecycle>) -> Result<()> + Send + 'static,
    {
        if self.server.is_some() {
            bail!("server thread already started");
        }
        let lifecycle = self.lifecycle.clone();
        let handle = thread::Builder::new()
            .name("glaze-server".into())
            .spawn(move || server(lifecycle))
            .context("Failed to spawn server thread")?;
        self.server = Some(handle);
        info!("Server thread started");
        Ok(())
    }

    /// Supply (`true`) or withdraw (`false`) the surface
    pub fn set_surface(&mut self, present: bool) -> Result<()> {
        if present {
            self.attach()
        } else {
            self.detach()
        }
    }

    fn attach(&mut self) -> Result<()> {
        if self.surface.is_some() {
            bail!("surface already attached");
        }
        let surface = self.surfaces.acquire().context("Failed to acquire surface")?;

        let started = self
            .lifecycle
            .wait_for(LifecycleState::Initialized)
            .and_then(|()| self.lifecycle.request_startup(surface.width, surface.height))
            .and_then(|()| self.lifecycle.wait_for(LifecycleState::ResponseStartedUp));
        if let Err(e) = started {
            self.surfaces.release(surface);
            return Err(e).context("Server did not start");
        }

        info!("Surface {}x{} attached", surface.width, surface.height);
        self.surface = Some(surface);
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        let Some(surface) = self.surface.take() else {
            return Ok(());
        };
        let stopped = self
            .lifecycle
            .request_shutdown()
            .and_then(|()| {
                self.lifecycle
                    .wait_for_timeout(LifecycleState::ResponseShutdown, self.shutdown_timeout)
            });
        self.surfaces.release(surface);
        stopped.context("Server did not shut down cleanly")?;
        info!("Surface detached");
        Ok(())
    }

    /// Shut down if needed, join the server thread and report how it exited
    pub fn stop(&mut self) -> Result<()> {
        if self.surface.is_some() {
            if let Err(e) = self.detach() {
                if matches!(
                    e.downcast_ref::<LifecycleError>(),
                    Some(LifecycleError::TimedOut(_))
                ) {
                    error!("Leaving the server thread behind: {:#}", e);
                    self.server = None;
                    return Err(e);
                }
                warn!("{:#}", e);
            }
        } else if self.lifecycle.state() < LifecycleState::RequestStartup {
            self.lifecycle.abort("stopped before a surface was supplied");
        }

        let Some(server) = self.server.take() else {
            return Ok(());
        };
        server
            .join()
            .map_err(|_| anyhow!("server thread panicked"))?
    }

    #[cfg(test)]
    pub fn surface(&self) -> Option<Surface> {
        self.surface
    }
}

impl Drop for PlatformBridge {
    fn drop(&mut self) {
        if self.server.is_some() {
            if let Err(e) = self.stop() {
                warn!("Server exited with error: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Side;
    use crate::render::HeadlessSurfaceProvider;

    /// Minimal server side that just walks the lifecycle
    fn walk(lifecycle: Arc<Lifecycle>) -> Result<()> {
        lifecycle.advance(Side::Server, LifecycleState::Initialized)?;
        lifecycle.wait_for(LifecycleState::RequestStartup)?;
        lifecycle.advance(Side::Server, LifecycleState::ResponseStartingUp)?;
        lifecycle.advance(Side::Server, LifecycleState::ResponseStartedUp)?;
        lifecycle.wait_for(LifecycleState::RequestShutdown)?;
        lifecycle.advance(Side::Server, LifecycleState::ResponseShuttingDown)?;
        lifecycle.advance(Side::Server, LifecycleState::ResponseShutdown)?;
        Ok(())
    }

    #[test]
    fn test_surface_round_trip() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(64, 48)),
        );
        bridge.start(walk).unwrap();
        assert!(bridge.start(walk).is_err());

        bridge.set_surface(true).unwrap();
        assert_eq!(bridge.surface(), Some(Surface { width: 64, height: 48 }));
        assert_eq!(lifecycle.surface_size(), Some((64, 48)));
        assert_eq!(
            lifecycle.history()[..4],
            [
                LifecycleState::Initialized,
                LifecycleState::RequestStartup,
                LifecycleState::ResponseStartingUp,
                LifecycleState::ResponseStartedUp,
            ]
        );

        bridge.set_surface(false).unwrap();
        assert_eq!(bridge.surface(), None);
        assert_eq!(lifecycle.state(), LifecycleState::ResponseShutdown);
        bridge.stop().unwrap();
    }

    #[test]
    fn test_server_error_is_reported_by_stop() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(8, 8)),
        );
        bridge
            .start(|lifecycle: Arc<Lifecycle>| {
                lifecycle.advance(Side::Server, LifecycleState::Initialized)?;
                lifecycle.wait_for(LifecycleState::RequestStartup)?;
                lifecycle.abort("no segments");
                bail!("no segments")
            })
            .unwrap();

        assert!(bridge.set_surface(true).is_err());
        assert_eq!(bridge.surface(), None);
        let err = bridge.stop().unwrap_err();
        assert!(err.to_string().contains("no segments"));
    }

    #[test]
    fn test_detach_without_surface_is_noop() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(lifecycle, Box::new(HeadlessSurfaceProvider::new(8, 8)));
        bridge.set_surface(false).unwrap();
        bridge.stop().unwrap();
    }

    #[test]
    fn test_stuck_shutdown_times_out() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut bridge = PlatformBridge::new(
            lifecycle.clone(),
            Box::new(HeadlessSurfaceProvider::new(8, 8)),
        );
        bridge.shutdown_timeout = Duration::from_millis(20);
        let (release, stuck) = std::sync::mpsc::channel::<()>();
        bridge
            .start(move |lifecycle: Arc<Lifecycle>| {
                lifecycle.advance(Side::Server, LifecycleState::Initialized)?;
                lifecycle.wait_for(LifecycleState::RequestStartup)?;
                lifecycle.advance(Side::Server, LifecycleState::ResponseStartingUp)?;
                lifecycle.advance(Side::Server, LifecycleState::ResponseStartedUp)?;
                // Never answers the shutdown request
                let _ = stuck.recv();
                Ok(())
            })
            .unwrap();
        bridge.set_surface(true).unwrap();

        let err = bridge.stop().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LifecycleError>(),
            Some(LifecycleError::TimedOut(LifecycleState::ResponseShutdown))
        ));
        assert_eq!(bridge.surface(), None);
        assert_eq!(lifecycle.state(), LifecycleState::RequestShutdown);
        drop(release);
    }
}
