//! Shared-memory segment layout
//!
//! `[size: u64 LE][flag: u8][payload: capacity bytes]`, mapped read/write by
//! the broker and every client holding the descriptor. The flag is published
//! after the payload with release ordering and observed with acquire ordering.
//!
//! Nothing arbitrates between several clients writing the same segment at
//! once; that is a known data race of the protocol.

use crate::error::ProtocolError;
use crate::serial::Serial;
use std::sync::atomic::{fence, Ordering};

pub const SIZE_OFFSET: usize = 0;
pub const FLAG_OFFSET: usize = 8;
pub const HEADER_LEN: usize = 9;

/// State byte of a segment
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlag {
    Empty = 0,
    /// A client wrote a request (or texture data) for the broker
    Request = 1,
    /// The broker wrote a reply for the client
    Reply = 2,
}

impl SegmentFlag {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SegmentFlag::Request,
            2 => SegmentFlag::Reply,
            _ => SegmentFlag::Empty,
        }
    }
}

/// Mapping size needed for `capacity` payload bytes
pub const fn mapping_len(capacity: usize) -> usize {
    HEADER_LEN + capacity
}

/// Payload capacity of a mapping
pub fn capacity(mem: &[u8]) -> usize {
    mem.len().saturating_sub(HEADER_LEN)
}

pub fn flag(mem: &[u8]) -> SegmentFlag {
    if mem.len() < HEADER_LEN {
        return SegmentFlag::Empty;
    }
    // SAFETY: in bounds; volatile because another process may store concurrently.
    let raw = unsafe { std::ptr::read_volatile(mem.as_ptr().add(FLAG_OFFSET)) };
    fence(Ordering::Acquire);
    SegmentFlag::from_u8(raw)
}

pub fn set_flag(mem: &mut [u8], flag: SegmentFlag) {
    if mem.len() < HEADER_LEN {
        return;
    }
    fence(Ordering::Release);
    // SAFETY: in bounds of an exclusively borrowed mapping.
    unsafe { std::ptr::write_volatile(mem.as_mut_ptr().add(FLAG_OFFSET), flag as u8) };
}

/// Copy `payload` into the segment and publish `flag`
pub fn write(mem: &mut [u8], payload: &[u8], flag: SegmentFlag) -> Result<(), ProtocolError> {
    let capacity = capacity(mem);
    if mem.len() < HEADER_LEN || payload.len() > capacity {
        return Err(ProtocolError::SegmentOverflow {
            len: payload.len(),
            capacity,
        });
    }
    mem[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    mem[SIZE_OFFSET..FLAG_OFFSET].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    set_flag(mem, flag);
    Ok(())
}

/// Borrow the payload currently stored in the segment
pub fn payload(mem: &[u8]) -> Result<&[u8], ProtocolError> {
    let capacity = capacity(mem);
    if mem.len() < HEADER_LEN {
        return Err(ProtocolError::SegmentOverflow { len: 0, capacity });
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&mem[SIZE_OFFSET..FLAG_OFFSET]);
    let size = u64::from_le_bytes(size);
    match usize::try_from(size) {
        Ok(len) if len <= capacity => Ok(&mem[HEADER_LEN..HEADER_LEN + len]),
        _ => Err(ProtocolError::SegmentOverflow {
            len: usize::try_from(size).unwrap_or(usize::MAX),
            capacity,
        }),
    }
}

/// Decode the stored payload as a message
pub fn read_message(mem: &[u8]) -> Result<Serial, ProtocolError> {
    Ok(Serial::from_bytes(payload(mem)?.to_vec()))
}
