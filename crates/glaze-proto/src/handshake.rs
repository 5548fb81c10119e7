//! Connection handshake record
//!
//! Reply to `new_connection`: a fixed-size C-compatible record, carried as a
//! count-prefixed byte array. It names the new connection's table entry, the
//! parameters segment it holds a reference on, and the socket its keep-alive
//! thread listens on.

use crate::error::ProtocolError;
use crate::serial::Serial;
use bytemuck::{Pod, Zeroable};
use std::ffi::OsStr;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Room for a `sockaddr_un` path plus terminator
pub const PATH_CAPACITY: usize = 128;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HandshakeRecord {
    /// Magic number to verify protocol sync
    pub magic: u32,
    pub version: u32,
    /// Connection table id assigned by the broker
    pub connection_id: u64,
    /// Payload capacity of the parameters segment
    pub params_size: u64,
    /// Parameters segment reference count after this connection took its lease
    pub params_references: u64,
    /// NUL-terminated keep-alive socket path; empty when liveness tracking failed
    pub keepalive_path: [u8; PATH_CAPACITY],
}

impl HandshakeRecord {
    pub const MAGIC: u32 = 0x455A_4C47; // "GLZE" in ASCII
    pub const VERSION: u32 = 1;

    /// Size of the record in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    pub fn new(
        connection_id: u64,
        params_size: u64,
        params_references: u64,
        keepalive_path: Option<&Path>,
    ) -> Result<Self, ProtocolError> {
        let mut record = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            connection_id,
            params_size,
            params_references,
            keepalive_path: [0; PATH_CAPACITY],
        };
        if let Some(path) = keepalive_path {
            let bytes = path.as_os_str().as_bytes();
            if bytes.len() >= PATH_CAPACITY || bytes.contains(&0) {
                return Err(ProtocolError::BadHandshake("keep-alive path does not fit"));
            }
            record.keepalive_path[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(record)
    }

    /// Keep-alive socket to connect to, if the broker started one
    pub fn keepalive_path(&self) -> Option<PathBuf> {
        let len = self
            .keepalive_path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PATH_CAPACITY);
        (len > 0).then(|| PathBuf::from(OsStr::from_bytes(&self.keepalive_path[..len])))
    }

    pub fn encode(&self) -> Serial {
        let mut serial = Serial::new();
        serial.append_bytes(bytemuck::bytes_of(self));
        serial
    }

    pub fn decode(serial: &mut Serial) -> Result<Self, ProtocolError> {
        let raw = serial.read_raw()?;
        if raw.len() != Self::size() {
            return Err(ProtocolError::Arity {
                field: "handshake record",
                expected: Self::size(),
                found: raw.len(),
            });
        }
        let record: Self = bytemuck::pod_read_unaligned(raw);
        if record.magic != Self::MAGIC {
            return Err(ProtocolError::BadHandshake("bad magic"));
        }
        if record.version != Self::VERSION {
            return Err(ProtocolError::BadHandshake("unsupported version"));
        }
        Ok(record)
    }
}
