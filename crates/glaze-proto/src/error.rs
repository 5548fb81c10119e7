//! Protocol errors
//!
//! Everything an untrusted peer can get wrong. These are always recoverable:
//! the broker drops the offending message and keeps serving.

use crate::command::Opcode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    Underrun { needed: usize, remaining: usize },

    #[error("{field}: expected {expected} elements, found {found}")]
    Arity {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),

    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    #[error("invalid texture dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },

    #[error("texture declares {expected} bytes but {found} were supplied")]
    PixelCountMismatch { expected: usize, found: usize },

    #[error("message of {len} bytes exceeds segment capacity of {capacity} bytes")]
    SegmentOverflow { len: usize, capacity: usize },

    #[error("segment holds no pending message")]
    NoPendingMessage,

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u64),

    #[error("{0} needs a socket connection for descriptor hand-off")]
    HandOffUnavailable(Opcode),

    #[error("malformed handshake record: {0}")]
    BadHandshake(&'static str),
}
