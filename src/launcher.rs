//! Client process launcher
//!
//! Starts the configured client binaries once the server is accepting
//! requests. Children learn where to connect from the environment and are
//! killed when the launcher is dropped.

use anyhow::{Context, Result};
use glaze_proto::{TransportMode, SOCKET_ENV, TRANSPORT_ENV};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

pub trait ProcessLauncher: Send {
    fn launch(&mut self, path: &Path) -> Result<()>;

    /// Collect clients that exited on their own. Returns how many still run.
    fn reap(&mut self) -> usize;
}

pub struct CommandLauncher {
    socket_path: PathBuf,
    transport: TransportMode,
    children: Vec<Child>,
}

impl CommandLauncher {
    pub fn new(socket_path: PathBuf, transport: TransportMode) -> Self {
        Self {
            socket_path,
            transport,
            children: Vec::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&mut self, path: &Path) -> Result<()> {
        debug!("Spawning client: {:?}", path);

        let child = Command::new(path)
            .env(SOCKET_ENV, &self.socket_path)
            .env(TRANSPORT_ENV, self.transport.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn client {:?}", path))?;

        info!("Launched client {:?} (pid {})", path, child.id());
        self.children.push(child);
        Ok(())
    }

    fn reap(&mut self) -> usize {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                info!("Client {} exited with {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll client {}: {}", child.id(), e);
                true
            }
        });
        self.running()
    }
}

impl Drop for CommandLauncher {
    fn drop(&mut self) {
        if self.running() > 0 {
            debug!("Stopping {} clients", self.running());
        }
        for mut child in self.children.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Launch every configured client, logging the ones that fail
pub fn launch_all(launcher: &mut dyn ProcessLauncher, clients: &[PathBuf]) -> usize {
    clients
        .iter()
        .filter(|path| match launcher.launch(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        })
        .count()
}
