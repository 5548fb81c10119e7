//! Shared-memory transport
//!
//! Requests are written by clients into the parameters segment with the flag
//! set to `Request`; the broker overwrites the segment with the reply and sets
//! `Reply`. A socket pair acts as the doorbell: clients write a byte after
//! publishing a request, and the broker writes one after publishing a reply,
//! so neither side spins on the flag.
//!
//! The listening socket stays open for the handshake commands that must hand
//! off descriptors (`shm_params`, `shm_texture`, `new_connection`). Such
//! connections are accepted first and answered on the socket.

use super::{register, wait_readable, Listener, Transport, DOORBELL, LISTENER};
use crate::error::{BrokerError, BrokerResult};
use crate::shm::{RegionManager, PARAMS_SEGMENT};
use glaze_proto::fdpass::send_frame_with_fds;
use glaze_proto::frame::{read_frame, write_frame};
use glaze_proto::{SegmentFlag, Serial, TransportMode};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::{trace, warn};

/// Where the message being handled came from
enum Origin {
    None,
    Socket(UnixStream),
    Segment { replied: bool },
}

pub struct SharedMemoryTransport {
    listener: Listener,
    poll: mio::Poll,
    events: mio::Events,
    poll_interval: Duration,
    doorbell: UnixStream,
    doorbell_peer: UnixStream,
    origin: Origin,
}

impl SharedMemoryTransport {
    pub fn bind(path: &Path, poll_interval: Duration, io_timeout: Duration) -> io::Result<Self> {
        let listener = Listener::bind(path, io_timeout)?;
        let (doorbell, doorbell_peer) = UnixStream::pair()?;
        doorbell.set_nonblocking(true)?;

        let poll = mio::Poll::new()?;
        register(&poll, listener.raw_fd(), LISTENER)?;
        register(&poll, doorbell.as_raw_fd(), DOORBELL)?;

        Ok(Self {
            listener,
            poll,
            events: mio::Events::with_capacity(4),
            poll_interval,
            doorbell,
            doorbell_peer,
            origin: Origin::None,
        })
    }

    /// Take whatever is ready right now without waiting
    fn try_receive(&mut self, regions: &mut RegionManager) -> BrokerResult<Option<Serial>> {
        if let Some(mut stream) = self.listener.accept()? {
            let serial = read_frame(&mut stream)?;
            trace!("Received {} byte message on socket", serial.len());
            self.origin = Origin::Socket(stream);
            return Ok(Some(serial));
        }

        // Nobody has mapped the parameters segment yet.
        if regions.reference_count(PARAMS_SEGMENT)? == 0 {
            return Ok(None);
        }
        if regions.flag(PARAMS_SEGMENT)? != SegmentFlag::Request {
            return Ok(None);
        }

        self.origin = Origin::Segment { replied: false };
        match regions.read(PARAMS_SEGMENT) {
            Ok(serial) => {
                trace!("Received {} byte message from segment", serial.len());
                Ok(Some(serial))
            }
            Err(e) => {
                // Answer it empty so the flag stops reading as a pending request.
                self.release(regions);
                Err(e)
            }
        }
    }

    fn drain_doorbell(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.doorbell).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Doorbell read failed: {}", e);
                    break;
                }
            }
        }
    }

    fn ring(&self) {
        match (&self.doorbell).write(&[1]) {
            Ok(_) => {}
            // Nobody is draining the peer end; the flag alone carries the reply.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("Doorbell write failed: {}", e),
        }
    }

    fn reply_to_segment(&mut self, reply: &Serial, regions: &mut RegionManager) -> BrokerResult<()> {
        regions.write(PARAMS_SEGMENT, reply, SegmentFlag::Reply)?;
        self.origin = Origin::Segment { replied: true };
        self.ring();
        Ok(())
    }
}

impl Transport for SharedMemoryTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::SharedMemory
    }

    fn receive(&mut self, regions: &mut RegionManager) -> BrokerResult<Option<Serial>> {
        self.origin = Origin::None;
        if let Some(serial) = self.try_receive(regions)? {
            return Ok(Some(serial));
        }
        wait_readable(&mut self.poll, &mut self.events, self.poll_interval)?;
        self.drain_doorbell();
        self.try_receive(regions)
    }

    fn send(&mut self, reply: &Serial, regions: &mut RegionManager) -> BrokerResult<()> {
        if let Origin::Socket(stream) = &mut self.origin {
            return write_frame(stream, reply).map_err(BrokerError::from);
        }
        if matches!(self.origin, Origin::Segment { .. }) {
            return self.reply_to_segment(reply, regions);
        }
        Err(io::Error::new(io::ErrorKind::NotConnected, "no message to reply to").into())
    }

    fn can_hand_off(&self) -> bool {
        matches!(self.origin, Origin::Socket(_))
    }

    fn hand_off_descriptor(&mut self, fds: &[BorrowedFd<'_>], reply: &Serial) -> BrokerResult<()> {
        match &self.origin {
            Origin::Socket(stream) => Ok(send_frame_with_fds(stream, reply, fds)?),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "descriptor hand-off needs a socket connection",
            )
            .into()),
        }
    }

    fn doorbell_peer(&self) -> io::Result<Option<OwnedFd>> {
        self.doorbell_peer.as_fd().try_clone_to_owned().map(Some)
    }

    fn release(&mut self, regions: &mut RegionManager) {
        if let Origin::Segment { replied: false } = self.origin {
            // The client waits for a reply flag even when the command has no payload.
            if let Err(e) = self.reply_to_segment(&Serial::new(), regions) {
                warn!("Failed to complete segment request: {}", e);
                if let Err(e) = regions.set_flag(PARAMS_SEGMENT, SegmentFlag::Empty) {
                    warn!("Failed to clear segment request: {}", e);
                }
            }
        }
        self.origin = Origin::None;
    }

    fn socket_path(&self) -> &Path {
        self.listener.path()
    }
}
