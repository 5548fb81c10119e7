//! Glaze Wire Protocol
//!
//! Shared definitions for communication between the `glaze` compositor broker
//! and its client processes: the flat message codec, opcodes, typed requests,
//! socket framing, descriptor hand-off, and the shared-memory segment layout.

pub mod command;
pub mod error;
pub mod fdpass;
pub mod frame;
pub mod handshake;
pub mod segment;
pub mod serial;

pub use command::{Handle, Opcode, PixelSource, Rect, Request, SegmentInfo};
pub use error::ProtocolError;
pub use handshake::HandshakeRecord;
pub use segment::SegmentFlag;
pub use serial::{Serial, WireValue};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable overriding the broker socket path
pub const SOCKET_ENV: &str = "GLAZE_SOCKET";

/// Environment variable telling launched clients which transport the broker runs
pub const TRANSPORT_ENV: &str = "GLAZE_TRANSPORT";

/// Byte a client writes on its keep-alive socket
pub const KEEPALIVE_PING: u8 = 0x70;

/// Byte the broker answers each ping with
pub const KEEPALIVE_PONG: u8 = 0x50;

/// Directory holding the broker's sockets
pub fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("/run/user/{}", unsafe { libc::getuid() })))
}

/// Socket path for IPC communication
pub fn socket_path() -> PathBuf {
    match std::env::var(SOCKET_ENV) {
        Ok(path) => PathBuf::from(path),
        Err(_) => runtime_dir().join("glaze.sock"),
    }
}

// ============================================================================
// Transport selection
// ============================================================================

/// How requests reach the broker. Selected once when the server starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// One connection per request, payload carried inline
    #[default]
    Socket,
    /// Requests written into the parameters segment, pixels into the texture segment
    SharedMemory,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Socket => "socket",
            TransportMode::SharedMemory => "shared_memory",
        }
    }

    /// Where `texture` requests carry their pixels under this mode
    pub fn pixel_source(self) -> PixelSource {
        match self {
            TransportMode::Socket => PixelSource::Inline,
            TransportMode::SharedMemory => PixelSource::Segment,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socket" => Ok(TransportMode::Socket),
            "shared_memory" | "shm" => Ok(TransportMode::SharedMemory),
            other => Err(format!("unknown transport mode {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!("socket".parse::<TransportMode>(), Ok(TransportMode::Socket));
        assert_eq!("shm".parse::<TransportMode>(), Ok(TransportMode::SharedMemory));
        assert_eq!(
            TransportMode::SharedMemory.to_string().parse::<TransportMode>(),
            Ok(TransportMode::SharedMemory)
        );
        assert!("pipe".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_pixel_source_follows_mode() {
        assert_eq!(TransportMode::Socket.pixel_source(), PixelSource::Inline);
        assert_eq!(TransportMode::SharedMemory.pixel_source(), PixelSource::Segment);
    }
}
