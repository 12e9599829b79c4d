use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::{
    connection::{Connection, ConnectionId, Topic},
    error::RegistryError,
    handshake::Role,
};

/// Live publishers and subscribers, partitioned by topic and role.
///
/// Every method takes the lock, touches only in-memory maps and releases it.
/// Callers get `Arc<Connection>` handles back and do their I/O afterwards.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    closed: bool,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    topics: HashMap<Topic, Partition>,
}

#[derive(Default)]
struct Partition {
    publishers: BTreeSet<ConnectionId>,
    subscribers: BTreeSet<ConnectionId>,
}

impl Partition {
    fn ids_mut(&mut self, role: Role) -> &mut BTreeSet<ConnectionId> {
        match role {
            Role::Publisher => &mut self.publishers,
            Role::Subscriber => &mut self.subscribers,
        }
    }

    fn is_empty(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub publishers: usize,
    pub subscribers: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let id = connection.id();

        if inner.closed {
            return Err(RegistryError::Closed(id));
        }
        if inner.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateAdmission(id));
        }

        inner
            .topics
            .entry(connection.topic().clone())
            .or_default()
            .ids_mut(connection.role())
            .insert(id);
        inner.connections.insert(id, connection);
        Ok(())
    }

    /// Removes the connection from whichever partition holds it.
    ///
    /// Absent ids are ignored: a closing read loop and a failed fan-out write
    /// regularly race to remove the same subscriber.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        let connection = inner.connections.remove(&id)?;

        let topic = connection.topic();
        if let Some(partition) = inner.topics.get_mut(topic) {
            partition.ids_mut(connection.role()).remove(&id);
            if partition.is_empty() {
                inner.topics.remove(topic);
            }
        }

        Some(connection)
    }

    /// Point-in-time copy of a topic's subscribers, ordered by id.
    pub async fn snapshot_subscribers(&self, topic: &Topic) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().await;
        let Some(partition) = inner.topics.get(topic) else {
            return Vec::new();
        };

        partition
            .subscribers
            .iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub async fn role_of(&self, id: ConnectionId) -> Option<Role> {
        let inner = self.inner.lock().await;
        inner.connections.get(&id).map(|connection| connection.role())
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.connections.contains_key(&id)
    }

    pub async fn counts(&self, topic: &Topic) -> RoleCounts {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(topic)
            .map(|partition| RoleCounts {
                publishers: partition.publishers.len(),
                subscribers: partition.subscribers.len(),
            })
            .unwrap_or_default()
    }

    /// Empties the registry and refuses every later admission, handing back
    /// the connections so the caller can close them.
    pub async fn close(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.topics.clear();
        let mut drained: Vec<_> = inner
            .connections
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        drained.sort_by_key(|connection| connection.id());
        drained
    }
}
