use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionId};

/// Index of live connections.
///
/// Holds weak references only: a connection is owned by its receive loop and
/// disappears from lookups once that loop lets go of it.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Weak<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: &Arc<Connection>) -> Result<()> {
        self.connections
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?
            .insert(conn.id(), Arc::downgrade(conn));
        Ok(())
    }

    pub fn remove(&self, id: ConnectionId) -> Result<()> {
        self.connections
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?
            .remove(&id);
        Ok(())
    }

    /// The connection, if it is registered and still alive.
    pub fn get(&self, id: ConnectionId) -> Result<Option<Arc<Connection>>> {
        Ok(self
            .connections
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string()))?
            .get(&id)
            .and_then(Weak::upgrade))
    }

    pub fn count(&self) -> usize {
        match self.connections.read() {
            Ok(connections) => connections.len(),
            Err(_) => {
                warn!("{}", constants::ERR_REGISTRY_READ_LOCK);
                0
            }
        }
    }

    pub fn ids(&self) -> Result<Vec<ConnectionId>> {
        Ok(self
            .connections
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string()))?
            .keys()
            .copied()
            .collect())
    }

    /// Close every live connection and empty the index.
    pub async fn close_all(&self) -> Result<()> {
        // Collect under the lock, close outside it.
        let live: Vec<Arc<Connection>> = {
            let mut connections = self
                .connections
                .write()
                .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
            connections.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        debug!(count = live.len(), "Closing registered connections");
        for conn in live {
            if let Err(e) = conn.close().await {
                debug!(conn_id = %conn.id(), error = %e, "Error closing connection");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::transport::connection::ConnectionOptions;

    fn connection() -> Arc<Connection> {
        let (local, _remote) = tokio::io::duplex(64);
        Arc::new(Connection::new(local, None, ConnectionOptions::default()))
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = Registry::new();
        let conn = connection();

        registry.add(&conn).unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.ids().unwrap(), vec![conn.id()]);
        assert_eq!(registry.get(conn.id()).unwrap().unwrap().id(), conn.id());

        registry.remove(conn.id()).unwrap();
        assert_eq!(registry.count(), 0);
        assert!(registry.get(conn.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_connection_is_not_returned() {
        let registry = Registry::new();
        let conn = connection();
        let id = conn.id();
        registry.add(&conn).unwrap();
        drop(conn);

        assert!(registry.get(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = Registry::new();
        let conns: Vec<_> = (0..5).map(|_| connection()).collect();
        for conn in &conns {
            registry.add(conn).unwrap();
        }

        registry.close_all().await.unwrap();
        assert_eq!(registry.count(), 0);
        assert!(conns.iter().all(|c| c.is_closed()));
    }
}
