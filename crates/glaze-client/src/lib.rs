//! Glaze client library
//!
//! Blocking helpers for talking to the `glaze` broker. `Client` opens one
//! socket connection per request. `ShmSession` maps the broker's segments and
//! sends requests through the parameters segment instead, ringing the
//! doorbell socket after each one.

use glaze_proto::command::{decode_handle, SegmentInfo};
use glaze_proto::fdpass::recv_frame_with_fds;
use glaze_proto::frame::{read_frame, write_frame};
use glaze_proto::{
    segment, Handle, HandshakeRecord, ProtocolError, Rect, Request, SegmentFlag, Serial,
    KEEPALIVE_PING, KEEPALIVE_PONG,
};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

pub use glaze_proto::TransportMode;

/// How long a request may wait for the broker
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("broker sent no descriptor for {0}")]
    MissingDescriptor(&'static str),

    #[error("no reply from the broker within {0:?}")]
    Timeout(Duration),

    #[error("unexpected keep-alive answer {0:#04x}")]
    BadPong(u8),
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Socket client
// ============================================================================

#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Client {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Client for the socket named by `GLAZE_SOCKET`, or the default path
    pub fn from_env() -> Self {
        Self::new(&glaze_proto::socket_path())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn send(&self, request: &Request) -> Result<UnixStream> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, &request.encode())?;
        trace!("Sent {}", request.opcode());
        Ok(stream)
    }

    /// Send a request that has a reply
    fn call(&self, request: &Request) -> Result<Serial> {
        let mut stream = self.send(request)?;
        Ok(read_frame(&mut stream)?)
    }

    /// Send a request without a reply and wait until the broker has handled it
    fn command(&self, request: &Request) -> Result<()> {
        let mut stream = self.send(request)?;
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest)?;
        Ok(())
    }

    pub fn new_window(&self, rect: Rect) -> Result<Handle> {
        let handle = decode_handle(&mut self.call(&Request::NewWindow(rect))?)?;
        debug!("Created window {} at {}", handle, rect);
        Ok(handle)
    }

    pub fn modify_window(&self, handle: Handle, rect: Rect) -> Result<()> {
        self.command(&Request::ModifyWindow { handle, rect })
    }

    pub fn close_window(&self, handle: Handle) -> Result<()> {
        self.command(&Request::CloseWindow { handle })
    }

    /// Upload RGBA `pixels` inline with the request
    pub fn texture(&self, handle: Handle, width: i32, height: i32, pixels: &[u8]) -> Result<()> {
        self.command(&Request::Texture {
            handle,
            width,
            height,
            pixels: Some(pixels.to_vec()),
        })
    }

    pub fn new_connection(&self) -> Result<HandshakeRecord> {
        Ok(HandshakeRecord::decode(&mut self.call(&Request::NewConnection)?)?)
    }

    pub fn shm_texture(&self) -> Result<SharedSegment> {
        self.share(Request::ShmTexture, "texture segment")
    }

    pub fn shm_params(&self) -> Result<SharedSegment> {
        self.share(Request::ShmParams, "parameters segment")
    }

    fn share(&self, request: Request, what: &'static str) -> Result<SharedSegment> {
        let stream = self.send(&request)?;
        let (mut reply, fds) = recv_frame_with_fds(&stream)?;
        let info = SegmentInfo::decode(&mut reply)?;

        let mut fds = fds.into_iter();
        let file = File::from(fds.next().ok_or(ClientError::MissingDescriptor(what))?);
        let doorbell = fds.next().map(UnixStream::from);

        let len = segment::mapping_len(info.size as usize);
        // SAFETY: the broker keeps the segment alive and sized for as long as it runs.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        debug!(
            "Mapped {} ({} bytes, {} references)",
            what, info.size, info.references
        );
        Ok(SharedSegment {
            map,
            info,
            doorbell,
        })
    }
}

/// A broker segment mapped into this process
pub struct SharedSegment {
    map: MmapMut,
    info: SegmentInfo,
    doorbell: Option<UnixStream>,
}

impl SharedSegment {
    pub fn info(&self) -> SegmentInfo {
        self.info
    }

    pub fn capacity(&self) -> usize {
        segment::capacity(&self.map)
    }

    pub fn flag(&self) -> SegmentFlag {
        segment::flag(&self.map)
    }

    pub fn write(&mut self, payload: &[u8], flag: SegmentFlag) -> Result<()> {
        Ok(segment::write(&mut self.map, payload, flag)?)
    }

    pub fn read_message(&self) -> Result<Serial> {
        Ok(segment::read_message(&self.map)?)
    }

    pub fn set_flag(&mut self, flag: SegmentFlag) {
        segment::set_flag(&mut self.map, flag)
    }

    /// Doorbell socket handed over with the parameters segment
    pub fn take_doorbell(&mut self) -> Option<UnixStream> {
        self.doorbell.take()
    }
}

// ============================================================================
// Shared-memory session
// ============================================================================

pub struct ShmSession {
    client: Client,
    params: SharedSegment,
    texture: SharedSegment,
    doorbell: Option<UnixStream>,
}

impl ShmSession {
    /// Map both segments through `client`
    pub fn connect(client: Client) -> Result<Self> {
        let texture = client.shm_texture()?;
        let mut params = client.shm_params()?;
        let doorbell = params.take_doorbell();
        if let Some(doorbell) = &doorbell {
            // Short reads so the reply flag is rechecked even if a ring is missed.
            doorbell.set_read_timeout(Some(Duration::from_millis(10)))?;
        }
        Ok(Self {
            client,
            params,
            texture,
            doorbell,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Publish a request in the parameters segment and wait for the reply
    pub fn call(&mut self, request: &Request) -> Result<Serial> {
        self.params
            .write(request.encode().as_bytes(), SegmentFlag::Request)?;
        if let Some(mut doorbell) = self.doorbell.as_ref() {
            doorbell.write_all(&[1])?;
        }

        let deadline = Instant::now() + self.client.timeout;
        while self.params.flag() != SegmentFlag::Reply {
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.client.timeout));
            }
            self.wait_for_ring()?;
        }

        let reply = self.params.read_message()?;
        self.params.set_flag(SegmentFlag::Empty);
        trace!("{} answered with {} bytes", request.opcode(), reply.len());
        Ok(reply)
    }

    fn wait_for_ring(&self) -> Result<()> {
        let Some(mut doorbell) = self.doorbell.as_ref() else {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(());
        };
        let mut buf = [0u8; 16];
        match doorbell.read(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn new_window(&mut self, rect: Rect) -> Result<Handle> {
        Ok(decode_handle(&mut self.call(&Request::NewWindow(rect))?)?)
    }

    pub fn modify_window(&mut self, handle: Handle, rect: Rect) -> Result<()> {
        self.call(&Request::ModifyWindow { handle, rect }).map(drop)
    }

    pub fn close_window(&mut self, handle: Handle) -> Result<()> {
        self.call(&Request::CloseWindow { handle }).map(drop)
    }

    /// Write RGBA `pixels` into the texture segment, then send the request
    pub fn texture(&mut self, handle: Handle, width: i32, height: i32, pixels: &[u8]) -> Result<()> {
        self.texture.write(pixels, SegmentFlag::Request)?;
        self.call(&Request::Texture {
            handle,
            width,
            height,
            pixels: None,
        })
        .map(drop)
    }

    pub fn new_connection(&mut self) -> Result<HandshakeRecord> {
        Ok(HandshakeRecord::decode(&mut self.call(&Request::NewConnection)?)?)
    }
}

// ============================================================================
// Keep-alive
// ============================================================================

/// Connection to a per-client keep-alive socket. The broker keeps the
/// connection's resources alive until this is dropped.
pub struct KeepAliveClient {
    stream: UnixStream,
}

impl KeepAliveClient {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        Ok(Self { stream })
    }

    pub fn ping(&self) -> Result<()> {
        (&self.stream).write_all(&[KEEPALIVE_PING])?;
        let mut pong = [0u8; 1];
        (&self.stream).read_exact(&mut pong)?;
        match pong[0] {
            KEEPALIVE_PONG => Ok(()),
            other => Err(ClientError::BadPong(other)),
        }
    }
}
