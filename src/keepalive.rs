//! Per-connection keep-alive threads
//!
//! Every `new_connection` gets a listening socket next to the broker socket
//! (`<socket>.<id>.alive`) and a thread that answers the client's pings. The
//! thread holds a lease on the parameters segment for as long as the client
//! stays connected; the lease is returned when the client hangs up or the
//! broker shuts down.

use crate::lifecycle::Lifecycle;
use crate::shm::SegmentLease;
use crate::transport::{register, wait_readable, Listener};
use anyhow::{Context, Result};
use glaze_proto::{Handle, KEEPALIVE_PONG};
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keep-alive socket for connection `id` of the broker listening on `socket`
pub fn keepalive_path(socket: &Path, id: Handle) -> PathBuf {
    let mut name = OsString::from(socket.as_os_str());
    name.push(format!(".{id}.alive"));
    PathBuf::from(name)
}

/// Liveness record of one connection
#[derive(Debug, Default)]
pub struct Liveness {
    pub connected: bool,
    pub pings: u64,
    pub last_ping: Option<Instant>,
}

pub struct KeepAlive {
    id: Handle,
    path: PathBuf,
    liveness: Arc<Mutex<Liveness>>,
    thread: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Bind the keep-alive socket on the calling thread, then hand it to a new thread
    pub fn spawn(
        socket: &Path,
        id: Handle,
        lease: SegmentLease,
        lifecycle: Arc<Lifecycle>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let path = keepalive_path(socket, id);
        let listener = Listener::bind(&path, poll_interval)
            .with_context(|| format!("Failed to bind keep-alive socket {:?}", path))?;
        let liveness = Arc::new(Mutex::new(Liveness::default()));

        let thread_liveness = liveness.clone();
        let thread = thread::Builder::new()
            .name(format!("glaze-keepalive-{id}"))
            .spawn(move || {
                if let Err(e) = serve(id, &listener, &lifecycle, &thread_liveness, poll_interval) {
                    warn!("Keep-alive for connection {} failed: {}", id, e);
                }
                debug!(
                    "Keep-alive for connection {} finished ({} parameter references left after release)",
                    id,
                    lease.references().saturating_sub(1)
                );
                drop(lease);
            })
            .context("Failed to spawn keep-alive thread")?;

        info!("Connection {} keep-alive listening on {:?}", id, path);
        Ok(Self {
            id,
            path,
            liveness,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Whether a client is attached right now
    pub fn connected(&self) -> bool {
        self.liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connected
    }

    pub fn pings(&self) -> u64 {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner).pings
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_ping
    }

    /// Wait for the thread to exit
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Keep-alive thread for connection {} panicked", self.id);
            }
        }
    }
}

fn serve(
    id: Handle,
    listener: &Listener,
    lifecycle: &Lifecycle,
    liveness: &Mutex<Liveness>,
    poll_interval: Duration,
) -> io::Result<()> {
    let mut poll = mio::Poll::new()?;
    let mut events = mio::Events::with_capacity(1);
    register(&poll, listener.raw_fd(), mio::Token(0))?;

    let mut client = loop {
        if lifecycle.shutdown_requested() {
            return Ok(());
        }
        if let Some(stream) = listener.accept()? {
            break stream;
        }
        wait_readable(&mut poll, &mut events, poll_interval)?;
    };
    debug!("Connection {} keep-alive client attached", id);
    liveness.lock().unwrap_or_else(PoisonError::into_inner).connected = true;

    let result = answer_pings(&mut client, lifecycle, liveness);
    liveness.lock().unwrap_or_else(PoisonError::into_inner).connected = false;
    result
}

fn answer_pings(
    client: &mut UnixStream,
    lifecycle: &Lifecycle,
    liveness: &Mutex<Liveness>,
) -> io::Result<()> {
    let mut buf = [0u8; 16];
    while !lifecycle.shutdown_requested() {
        match client.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                {
                    let mut record = liveness.lock().unwrap_or_else(PoisonError::into_inner);
                    record.pings += n as u64;
                    record.last_ping = Some(Instant::now());
                }
                client.write_all(&vec![KEEPALIVE_PONG; n])?;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
