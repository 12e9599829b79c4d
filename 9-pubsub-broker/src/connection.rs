use std::{fmt, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard, watch},
    time::timeout,
};
use tracing::debug;

use crate::{error::ConnectionLost, handshake::Role};

pub type ConnectionId = u64;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_TOPIC: &str = "default";

/// Key that partitions the registry. Clients cannot choose one yet, so every
/// connection lands on [`Topic::default`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A classified connection, shared between the registry and the tasks that
/// read from or write to it.
///
/// Only the write half lives here; the read half stays with the task that
/// drives the connection.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    topic: Topic,
    peer: SocketAddr,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        role: Role,
        topic: Topic,
        peer: SocketAddr,
        writer: BoxedWriter,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            role,
            topic,
            peer,
            writer: Mutex::new(writer),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Writes the whole chunk and flushes it.
    ///
    /// The writer lock is held for the full chunk so concurrent senders never
    /// interleave bytes inside one stream.
    pub async fn send(&self, bytes: &[u8], write_timeout: Duration) -> Result<(), ConnectionLost> {
        if self.is_closed() {
            return Err(ConnectionLost::Closed { id: self.id });
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        match timeout(write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ConnectionLost::Io {
                id: self.id,
                source,
            }),
            Err(_) => Err(ConnectionLost::WriteTimeout {
                id: self.id,
                after: write_timeout,
            }),
        }
    }

    /// Exclusive access to the write half, used to make admission and the
    /// `OK` reply a single step from a subscriber's point of view.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, BoxedWriter> {
        self.writer.lock().await
    }

    /// Marks the connection closed and shuts down its write half.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(id = self.id, error = ?err, "shutdown after close failed");
        }
        true
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("topic", &self.topic)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
