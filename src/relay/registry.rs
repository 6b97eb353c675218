use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::relay::connection::{Connection, ConnectionId};


/// A connection that could not be closed cleanly by [ConnectionRegistry::close_all]
#[derive(Debug)]
pub struct CloseFailure {
    pub connection: ConnectionId,
    pub remote_addr: SocketAddr,
    pub error: io::Error,
}

/// Keeps track of all live connections of a process, regardless of which session owns them, so
///  that they can all be closed when shutting down.
///
/// The registry holds weak references only: sessions own their connections, and a connection
///  whose session is gone already is skipped.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<FxHashMap<ConnectionId, Weak<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    /// Registering a connection that is registered already has no effect
    pub async fn register(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        if connections.insert(connection.id(), Arc::downgrade(connection)).is_none() {
            trace!("registered {:?}", connection);
        }
    }

    /// Unregistering a connection that is not registered has no effect
    pub async fn unregister(&self, connection: &Connection) {
        if self.connections.lock().await.remove(&connection.id()).is_some() {
            trace!("unregistered {:?}", connection);
        }
    }

    /// Closes every registered connection and empties the registry. Failures of individual
    ///  connections do not stop the others from being closed; they are collected and returned.
    pub async fn close_all(&self) -> Vec<CloseFailure> {
        let drained = std::mem::take(&mut *self.connections.lock().await);
        debug!("closing {} registered connections", drained.len());

        let mut failures = Vec::new();
        for (id, connection) in drained {
            let Some(connection) = connection.upgrade() else {
                trace!("{:?} was dropped by its session already", id);
                continue;
            };
            if let Err(e) = connection.close().await {
                warn!("error closing {:?}: {}", connection, e);
                failures.push(CloseFailure {
                    connection: id,
                    remote_addr: connection.remote_addr(),
                    error: e,
                });
            }
        }
        failures
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time;
    use crate::messaging::frame::DEFAULT_MAX_FRAME_LEN;
    use super::*;

    async fn connection(listener: &TcpListener) -> (Arc<Connection>, TcpStream) {
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let (connection, _reader) = Connection::new(stream, DEFAULT_MAX_FRAME_LEN).unwrap();
        (connection, accepted)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn, _other) = connection(&listener).await;
        let registry = ConnectionRegistry::new();

        registry.register(&conn).await;
        registry.register(&conn).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(conn.id()).await);

        registry.unregister(&conn).await;
        registry.unregister(&conn).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all_twice() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn_1, _other_1) = connection(&listener).await;
        let (conn_2, _other_2) = connection(&listener).await;
        let registry = ConnectionRegistry::new();
        registry.register(&conn_1).await;
        registry.register(&conn_2).await;

        assert!(registry.close_all().await.is_empty());
        assert!(registry.is_empty().await);
        assert!(conn_1.is_closed());
        assert!(conn_2.is_closed());

        assert!(registry.close_all().await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all_skips_dropped_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn, _other) = connection(&listener).await;
        let registry = ConnectionRegistry::new();
        registry.register(&conn).await;
        drop(conn);

        assert!(registry.close_all().await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_close_all_reports_failures_and_closes_the_rest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn_1, mut other_1) = connection(&listener).await;
        let (broken, other_broken) = connection(&listener).await;
        let (conn_2, mut other_2) = connection(&listener).await;
        let registry = ConnectionRegistry::new();
        for conn in [&conn_1, &broken, &conn_2] {
            registry.register(conn).await;
        }

        // the peer resets the connection, so shutting down its write direction fails
        other_broken.set_linger(Some(Duration::ZERO)).unwrap();
        drop(other_broken);
        time::sleep(Duration::from_millis(100)).await;

        let failures = registry.close_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].connection, broken.id());
        assert_eq!(failures[0].remote_addr, broken.remote_addr());
        assert!(registry.is_empty().await);

        // the other connections were closed regardless: their peers see EOF
        for other in [&mut other_1, &mut other_2] {
            let mut buf = [0u8; 16];
            assert_eq!(time::timeout(Duration::from_secs(5), other.read(&mut buf)).await.unwrap().unwrap(), 0);
        }
        assert!(conn_1.is_closed());
        assert!(conn_2.is_closed());
    }
}
