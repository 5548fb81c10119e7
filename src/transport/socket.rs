//! One connection per request
//!
//! A client connects, writes one frame, reads at most one reply and is
//! disconnected when the message is released.

use super::{register, wait_readable, Listener, Transport, LISTENER};
use crate::error::{BrokerError, BrokerResult};
use crate::shm::RegionManager;
use glaze_proto::fdpass::send_frame_with_fds;
use glaze_proto::frame::{read_frame, write_frame};
use glaze_proto::{Serial, TransportMode};
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::trace;

pub struct SocketTransport {
    listener: Listener,
    poll: mio::Poll,
    events: mio::Events,
    poll_interval: Duration,
    current: Option<UnixStream>,
}

impl SocketTransport {
    pub fn bind(path: &Path, poll_interval: Duration, io_timeout: Duration) -> io::Result<Self> {
        let listener = Listener::bind(path, io_timeout)?;
        let poll = mio::Poll::new()?;
        register(&poll, listener.raw_fd(), LISTENER)?;
        Ok(Self {
            listener,
            poll,
            events: mio::Events::with_capacity(4),
            poll_interval,
            current: None,
        })
    }

    fn accept(&mut self) -> io::Result<Option<UnixStream>> {
        if let Some(stream) = self.listener.accept()? {
            return Ok(Some(stream));
        }
        wait_readable(&mut self.poll, &mut self.events, self.poll_interval)?;
        self.listener.accept()
    }

    fn current(&self) -> io::Result<&UnixStream> {
        self.current
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection to reply on"))
    }
}

impl Transport for SocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Socket
    }

    fn receive(&mut self, _regions: &mut RegionManager) -> BrokerResult<Option<Serial>> {
        self.current = None;
        let Some(mut stream) = self.accept()? else {
            return Ok(None);
        };
        let serial = read_frame(&mut stream)?;
        trace!("Received {} byte message", serial.len());
        self.current = Some(stream);
        Ok(Some(serial))
    }

    fn send(&mut self, reply: &Serial, _regions: &mut RegionManager) -> BrokerResult<()> {
        let mut stream = self.current()?;
        write_frame(&mut stream, reply).map_err(BrokerError::from)
    }

    fn can_hand_off(&self) -> bool {
        self.current.is_some()
    }

    fn hand_off_descriptor(&mut self, fds: &[BorrowedFd<'_>], reply: &Serial) -> BrokerResult<()> {
        send_frame_with_fds(self.current()?, reply, fds)?;
        Ok(())
    }

    fn release(&mut self, _regions: &mut RegionManager) {
        self.current = None;
    }

    fn socket_path(&self) -> &Path {
        self.listener.path()
    }
}
