use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::messaging::frame::{encode_frame, FrameReader, DEFAULT_MAX_FRAME_LEN};
use crate::messaging::message::{Message, MessageId, MessageKind};
use crate::messaging::peer_id::PeerId;


const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A peer that reads and writes individual frames (or arbitrary bytes), for testing how the other
///  end of a connection reacts to them. Receiving panics if nothing arrives within five seconds.
///
/// Until it performed a handshake, the peer identifies as `server` in the messages it builds.
pub struct RawPeer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
    id: PeerId,
}

impl RawPeer {
    pub fn new(stream: TcpStream) -> RawPeer {
        let (read_half, write_half) = stream.into_split();
        RawPeer {
            reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_LEN),
            writer: write_half,
            cancel: CancellationToken::new(),
            id: PeerId::server(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> RawPeer {
        RawPeer::new(TcpStream::connect(addr).await.unwrap())
    }

    /// connects and performs the HELLO handshake, expecting the server to accept `name`
    pub async fn connect_as(addr: SocketAddr, name: &str) -> RawPeer {
        let mut peer = RawPeer::connect(addr).await;
        peer.id = PeerId::new(name).unwrap();
        peer.send(&Message::hello(MessageId::HELLO, peer.id.clone())).await;

        let response = peer.receive().await.unwrap();
        assert_eq!(response.kind(), MessageKind::Ack, "handshake for {} failed: {:?}", name, response);
        peer
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = encode_frame(message, DEFAULT_MAX_FRAME_LEN).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn receive(&mut self) -> Result<Message, RelayError> {
        time::timeout(RECEIVE_TIMEOUT, self.reader.receive(&self.cancel))
            .await
            .expect("no message received within timeout")
    }

    /// Receives the next DATA message and acknowledges it. Other messages are skipped.
    pub async fn receive_data(&mut self) -> Message {
        loop {
            let message = self.receive().await.unwrap();
            if message.kind() == MessageKind::Data {
                self.send(&Message::ack(message.id(), self.id.clone())).await;
                return message;
            }
        }
    }

    /// Receives until the other side closes the connection, returning everything that arrived
    ///  on the way. Nothing is acknowledged.
    pub async fn drain_until_closed(&mut self) -> Result<Vec<Message>, RelayError> {
        let mut result = Vec::new();
        loop {
            match self.receive().await {
                Ok(message) => result.push(message),
                Err(RelayError::ConnectionClosed) => return Ok(result),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}
