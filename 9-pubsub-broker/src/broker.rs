use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::BrokerConfig,
    connection::{Connection, ConnectionId},
    error::RegistryError,
    fanout::{reap, run_publisher, watch_subscriber},
    handshake::{self, Role},
    registry::Registry,
};

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener, config: BrokerConfig) -> Self {
        Self::with_registry(listener, config, Arc::new(Registry::new()))
    }

    pub fn with_registry(
        listener: TcpListener,
        config: BrokerConfig,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState {
                registry,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct BrokerState {
    registry: Arc<Registry>,
    config: BrokerConfig,
    next_id: AtomicU64,
}

impl BrokerState {
    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn handle_shutdown(state: &BrokerState) {
    let connections = state.registry.close().await;
    info!(connections = connections.len(), "broker shutting down");
    for connection in connections {
        connection.close().await;
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<BrokerState>) {
    let state = Arc::clone(state);
    let id = state.next_id();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(id, stream, peer, state).await {
            warn!(id, peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<BrokerState>,
) -> Result<()> {
    debug!(id, peer = %peer, "accepted connection");
    let (mut reader, writer) = stream.into_split();

    // Dropping both halves on error closes the socket without a reply.
    let handshake = handshake::read_handshake(&mut reader, &state.config.handshake)
        .await
        .context("handshake failed")?;

    let connection = Arc::new(Connection::new(
        id,
        handshake.role,
        state.config.topic.clone(),
        peer,
        Box::new(writer),
    ));
    admit(&state.registry, &connection).await?;
    info!(id, peer = %peer, role = %connection.role(), "connection admitted");

    match connection.role() {
        Role::Publisher => {
            run_publisher(
                &state.registry,
                &connection,
                &mut reader,
                handshake.leftover,
                state.config.write_timeout,
            )
            .await
        }
        Role::Subscriber => watch_subscriber(&state.registry, &connection, &mut reader).await,
    }

    Ok(())
}

/// Registers the connection and replies `OK` while holding its writer, so no
/// fan-out pass can write to a new subscriber before the acknowledgment.
async fn admit(registry: &Registry, connection: &Arc<Connection>) -> Result<()> {
    let mut writer = connection.lock_writer().await;

    if let Err(err) = registry.admit(Arc::clone(connection)).await {
        match &err {
            RegistryError::Closed(_) => {
                debug!(id = connection.id(), "broker shut down during handshake");
            }
            RegistryError::DuplicateAdmission(_) => {
                error!(id = connection.id(), error = %err, "refusing connection");
            }
        }
        drop(writer);
        connection.close().await;
        return Err(err.into());
    }

    if let Err(err) = handshake::acknowledge(&mut *writer).await {
        drop(writer);
        reap(registry, connection).await;
        return Err(err).context("failed to acknowledge handshake");
    }

    Ok(())
}
