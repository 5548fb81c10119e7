//! Broker error types
//!
//! `BrokerError` is what a single serving-loop step can fail with. Only
//! resource invariant violations and lifecycle failures end the server; every
//! other variant drops the current message and the loop carries on.

use crate::lifecycle::LifecycleError;
use crate::shm::SegmentError;
use crate::table::TableError;
use glaze_proto::ProtocolError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Accept failures, timeouts, peers that went away mid-message
    #[error("transient transport error: {0}")]
    Transport(#[from] io::Error),

    /// A well-known segment is no longer usable
    #[error("resource invariant violated: {0}")]
    ResourceInvariant(#[from] SegmentError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The render collaborator refused a call; the message is dropped
    #[error("renderer failed: {0:#}")]
    Render(anyhow::Error),
}

impl From<TableError> for BrokerError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::InvalidHandle(handle) => {
                BrokerError::Protocol(ProtocolError::UnknownHandle(handle))
            }
        }
    }
}

impl BrokerError {
    /// Whether the server must stop instead of dropping the message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::ResourceInvariant(_) | BrokerError::Lifecycle(_)
        )
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!BrokerError::from(ProtocolError::UnknownOpcode(9)).is_fatal());
        assert!(!BrokerError::from(io::Error::from(io::ErrorKind::TimedOut)).is_fatal());
        assert!(BrokerError::from(SegmentError::Unknown("params")).is_fatal());
    }

    #[test]
    fn test_table_errors_become_protocol_errors() {
        let err = BrokerError::from(TableError::InvalidHandle(4));
        assert!(matches!(
            err,
            BrokerError::Protocol(ProtocolError::UnknownHandle(4))
        ));
    }
}
