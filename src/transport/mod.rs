//! Request transports
//!
//! Both transports carry the same wire protocol and are picked once when the
//! server starts. Each serving-loop iteration receives at most one message,
//! lets the dispatcher send at most one reply, then releases the channel.

mod shm;
mod socket;

pub use shm::SharedMemoryTransport;
pub use socket::SocketTransport;

use crate::error::BrokerResult;
use crate::shm::RegionManager;
use glaze_proto::{Serial, TransportMode};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LISTENER: mio::Token = mio::Token(0);
const DOORBELL: mio::Token = mio::Token(1);

pub trait Transport: Send {
    fn mode(&self) -> TransportMode;

    /// Wait (bounded by the poll interval) for the next message
    fn receive(&mut self, regions: &mut RegionManager) -> BrokerResult<Option<Serial>>;

    /// Reply on the channel the current message arrived on
    fn send(&mut self, reply: &Serial, regions: &mut RegionManager) -> BrokerResult<()>;

    /// Whether the current message arrived on a socket that can carry descriptors
    fn can_hand_off(&self) -> bool;

    /// Reply with `fds` attached
    fn hand_off_descriptor(&mut self, fds: &[BorrowedFd<'_>], reply: &Serial) -> BrokerResult<()>;

    /// Descriptor clients use to wake the server, if this transport has one
    fn doorbell_peer(&self) -> io::Result<Option<OwnedFd>> {
        Ok(None)
    }

    /// Finish the current message
    fn release(&mut self, regions: &mut RegionManager);

    fn socket_path(&self) -> &Path;
}

/// Bind the transport selected by `mode`
pub fn bind(
    mode: TransportMode,
    path: &Path,
    poll_interval: Duration,
    io_timeout: Duration,
) -> io::Result<Box<dyn Transport>> {
    Ok(match mode {
        TransportMode::Socket => Box::new(SocketTransport::bind(path, poll_interval, io_timeout)?),
        TransportMode::SharedMemory => Box::new(SharedMemoryTransport::bind(
            path,
            poll_interval,
            io_timeout,
        )?),
    })
}

// ============================================================================
// Listening socket shared by both transports
// ============================================================================

/// Non-blocking listener that removes its socket file when dropped
pub(crate) struct Listener {
    listener: UnixListener,
    path: PathBuf,
    io_timeout: Duration,
}

impl Listener {
    pub fn bind(path: &Path, io_timeout: Duration) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!("Removing stale socket {:?}", path);
            fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            io_timeout,
        })
    }

    /// Accept one pending connection, if any
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.io_timeout))?;
                stream.set_write_timeout(Some(self.io_timeout))?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", self.path, e);
            }
        }
    }
}

/// Block in `poll` for up to `timeout`; interrupted waits count as timeouts
pub(crate) fn wait_readable(
    poll: &mut mio::Poll,
    events: &mut mio::Events,
    timeout: Duration,
) -> io::Result<()> {
    match poll.poll(events, Some(timeout)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn register(poll: &mio::Poll, fd: RawFd, token: mio::Token) -> io::Result<()> {
    poll.registry()
        .register(&mut mio::unix::SourceFd(&fd), token, mio::Interest::READABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glaze.sock");
        let listener = Listener::bind(&path, Duration::from_millis(100)).unwrap();
        assert!(path.exists());
        assert!(listener.accept().unwrap().is_none());
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glaze.sock");
        fs::write(&path, b"stale").unwrap();
        let _listener = Listener::bind(&path, Duration::from_millis(100)).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
    }
}
