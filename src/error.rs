use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::messaging::message::MessageId;
use crate::messaging::peer_id::PeerId;

/// The conditions that the relay reports to its callers. Which of them are fatal depends on
///  where they occur: everything that happens inside a session ends that session only, never the
///  relay server's accept loop or other sessions.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Establishing a client connection failed (refused, timed out, or the server rejected the
    ///  handshake). Nothing was registered when this is returned.
    #[error("could not connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    /// A malformed or unexpected frame - fatal for the session it was received on
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer (or local code) closed the connection. This is the regular way for a session to end.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("message {id} was not acknowledged within {window:?}")]
    AckTimeout { id: MessageId, window: Duration },

    #[error("peer {0} is not connected to the relay")]
    PeerUnreachable(PeerId),

    #[error("message id {0} is already awaiting an acknowledgement")]
    DuplicateMessageId(MessageId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Resets and aborts are the peer going away rather than something going wrong locally
    pub fn from_io(e: io::Error) -> RelayError {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RelayError::ConnectionClosed,
            _ => RelayError::Io(e),
        }
    }

    /// `true` for the ways a session ends without anything going wrong
    pub fn is_regular_termination(&self) -> bool {
        matches!(self, RelayError::ConnectionClosed | RelayError::Cancelled)
    }
}
