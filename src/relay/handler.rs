use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::messaging::message::{Message, MessageId};
use crate::messaging::peer_id::PeerId;


/// The application callbacks of a peer session.
///
/// `on_message` is called for every inbound DATA message, and the session acknowledges the message
///  once the callback returns. Returning [RelayError::PeerUnreachable] makes the session answer
///  with UNREACHABLE instead of an ACK; other errors are logged and the message is acknowledged
///  anyway, since it was received.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_message(&self, from: &PeerId, message: &Message) -> Result<(), RelayError>;

    /// The relay server reported that there is no session for the target of a message sent earlier
    async fn on_unreachable(&self, id: MessageId, target: Option<PeerId>);

    /// Called once per session, after its connection was closed
    async fn on_disconnect(&self, peer: &PeerId);
}


/// Logs everything it receives - the handler for demo clients
pub struct LoggingHandler {
    pub name: String,
}

#[async_trait]
impl SessionHandler for LoggingHandler {
    async fn on_message(&self, from: &PeerId, message: &Message) -> Result<(), RelayError> {
        match message.payload_str() {
            Some(text) => info!("{} received from {}: {}", self.name, message.sender(), text),
            None => info!("{} received {} bytes of binary data from {} via {}", self.name, message.payload().len(), message.sender(), from),
        }
        Ok(())
    }

    async fn on_unreachable(&self, id: MessageId, target: Option<PeerId>) {
        match target {
            Some(target) => warn!("{}: message {} could not be delivered, {} is not connected", self.name, id, target),
            None => warn!("{}: message {} could not be delivered", self.name, id),
        }
    }

    async fn on_disconnect(&self, peer: &PeerId) {
        info!("{}: disconnected from {}", self.name, peer);
    }
}
