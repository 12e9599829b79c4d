use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId, Topic},
    registry::Registry,
};

/// Largest chunk a publisher read hands to one fan-out pass.
pub const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

/// Writes `bytes` to every subscriber of `topic` registered right now.
///
/// Writes run concurrently and the pass waits for all of them, so a publisher
/// never starts its next chunk before this one reached (or failed on) every
/// subscriber. Failed subscribers are removed and closed; the rest are not
/// affected.
pub async fn fan_out(
    registry: &Registry,
    topic: &Topic,
    bytes: &[u8],
    write_timeout: Duration,
) -> FanOutReport {
    let subscribers = registry.snapshot_subscribers(topic).await;
    let writes = subscribers
        .iter()
        .map(|subscriber| subscriber.send(bytes, write_timeout));
    let results = join_all(writes).await;

    let mut report = FanOutReport::default();
    for (subscriber, result) in subscribers.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                debug!(
                    id = subscriber.id(),
                    error = %err,
                    "dropping subscriber after failed write"
                );
                reap(registry, subscriber).await;
                report.dropped.push(subscriber.id());
            }
        }
    }

    report
}

/// Drains one publisher until it disconnects, forwarding every chunk.
///
/// `leftover` holds bytes that arrived together with the handshake frame and
/// is forwarded first. The publisher is always removed and closed on return.
pub async fn run_publisher<R>(
    registry: &Registry,
    publisher: &Arc<Connection>,
    reader: &mut R,
    leftover: Vec<u8>,
    write_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    if !leftover.is_empty() {
        fan_out(registry, publisher.topic(), &leftover, write_timeout).await;
    }

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = select! {
            read = reader.read(&mut buffer) => read,
            _ = publisher.closed() => break,
        };

        match read {
            Ok(0) => {
                debug!(id = publisher.id(), "publisher reached end of stream");
                break;
            }
            Ok(n) => {
                let report =
                    fan_out(registry, publisher.topic(), &buffer[..n], write_timeout).await;
                debug!(
                    id = publisher.id(),
                    bytes = n,
                    delivered = report.delivered,
                    dropped = report.dropped.len(),
                    "fan-out pass complete"
                );
            }
            Err(err) => {
                warn!(id = publisher.id(), error = ?err, "publisher read failed");
                break;
            }
        }
    }

    reap(registry, publisher).await;
}

/// Keeps reading from a subscriber so a departed peer is noticed without
/// waiting for the next failed write. Anything the subscriber sends is
/// discarded.
pub async fn watch_subscriber<R>(registry: &Registry, subscriber: &Arc<Connection>, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 256];
    loop {
        let read = select! {
            read = reader.read(&mut buffer) => read,
            _ = subscriber.closed() => break,
        };

        match read {
            Ok(0) => break,
            Ok(n) => debug!(id = subscriber.id(), bytes = n, "ignoring bytes from subscriber"),
            Err(err) => {
                debug!(id = subscriber.id(), error = ?err, "subscriber read failed");
                break;
            }
        }
    }

    reap(registry, subscriber).await;
}

/// Removes the connection from the registry and closes it. Safe to call from
/// every loop that notices the connection is gone; only the first caller logs.
pub async fn reap(registry: &Registry, connection: &Connection) {
    let removed = registry.remove(connection.id()).await.is_some();
    let closed = connection.close().await;
    if removed || closed {
        info!(
            id = connection.id(),
            peer = %connection.peer(),
            role = %connection.role(),
            "connection removed"
        );
    }
}
