use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::messaging::frame::{FrameReader, FrameWriter};
use crate::messaging::message::Message;


static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a [Connection], used as the key in the connection registry
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}


/// The write side of an established TCP connection, plus its addresses and open / closed state.
///
/// The peer session that creates a connection owns it (and its [FrameReader]); the connection
///  registry only holds a weak reference so that it can close whatever is still open at shutdown.
pub struct Connection {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    created_at: SystemTime,
    writer: FrameWriter<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> io::Result<(Arc<Connection>, FrameReader<OwnedReadHalf>)> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new(Connection {
            id: ConnectionId::next(),
            local_addr,
            remote_addr,
            created_at: SystemTime::now(),
            writer: FrameWriter::new(write_half, max_frame_len),
            closed: CancellationToken::new(),
        });
        Ok((connection, FrameReader::new(read_half, max_frame_len)))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub async fn send(&self, message: &Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        self.writer.send(message).await
    }

    /// Closes the connection: pending and future reads through [Connection::closed_token] are
    ///  cancelled, and the write direction is shut down (sending FIN to the peer). Closing a
    ///  connection that is closed already is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        if !self.closed.is_cancelled() {
            debug!("closing connection {:?} to {:?}", self.id, self.remote_addr);
        }
        self.closed.cancel();
        self.writer.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancelled when the connection is closed - the owning session's read loop listens to this
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}: {:?} -> {:?}{}}}", self.id, self.local_addr, self.remote_addr, if self.is_closed() { " (closed)" } else { "" })
    }
}
