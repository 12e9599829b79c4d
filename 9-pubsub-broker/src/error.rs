use std::{io, time::Duration};

use thiserror::Error;

use crate::connection::ConnectionId;

/// Failures of the handshake exchange, on either end.
///
/// On the broker, every variant except `Encode` and `Rejected` means the
/// socket is refused: it is closed without writing `OK`. `Encode` and
/// `Rejected` are raised by clients sending the frame and waiting for `OK`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake frame within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before a complete handshake frame")]
    Closed,
    #[error("handshake frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("malformed handshake frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("handshake frame has no ClientType")]
    MissingClientType,
    #[error("unknown ClientType {0:?}")]
    UnknownClientType(String),
    #[error("failed to encode handshake frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("broker did not acknowledge the handshake")]
    Rejected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateAdmission(ConnectionId),
    #[error("registry is closed; connection {0} refused")]
    Closed(ConnectionId),
}

/// A read or write on an admitted connection failed or hit EOF.
#[derive(Debug, Error)]
pub enum ConnectionLost {
    #[error("write to connection {id} timed out after {after:?}")]
    WriteTimeout { id: ConnectionId, after: Duration },
    #[error("connection {id} is closed")]
    Closed { id: ConnectionId },
    #[error("i/o on connection {id} failed: {source}")]
    Io {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}
