//! Socket framing
//!
//! A byte stream carries one `Serial` per frame: an 8-byte little-endian
//! length followed by the serial bytes. The same length-then-payload shape is
//! used by shared-memory segments.

use crate::error::ProtocolError;
use crate::serial::Serial;
use std::io::{self, Read, Write};

/// Length prefix size
pub const HEADER_LEN: usize = 8;

/// Largest frame a peer may announce. Inline textures for a 4K surface fit.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Encode a serial with its length prefix
pub fn encode_frame(serial: &Serial) -> Vec<u8> {
    let bytes = serial.as_bytes();
    let mut buf = Vec::with_capacity(HEADER_LEN + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Validate a received length prefix
pub fn frame_len(header: [u8; HEADER_LEN]) -> io::Result<usize> {
    let len = u64::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge(len),
        ));
    }
    Ok(len as usize)
}

pub fn write_frame<W: Write>(writer: &mut W, serial: &Serial) -> io::Result<()> {
    writer.write_all(&encode_frame(serial))?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Serial> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    read_payload(reader, header)
}

/// Read the payload announced by an already-received header
pub fn read_payload<R: Read>(reader: &mut R, header: [u8; HEADER_LEN]) -> io::Result<Serial> {
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Serial::from_bytes(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip() {
        let mut serial = Serial::new();
        serial.append(1i32).append_bytes(&[0i32, 0, 100, 100]);

        let mut wire = Vec::new();
        write_frame(&mut wire, &serial).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + serial.len());

        let decoded = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded.as_bytes(), serial.as_bytes());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let wire = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame() {
        let mut wire = 16u64.to_le_bytes().to_vec();
        wire.extend_from_slice(&[1, 2, 3]);
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_empty_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Serial::new()).unwrap();
        let decoded = read_frame(&mut Cursor::new(wire)).unwrap();
        assert!(decoded.is_empty());
    }
}
