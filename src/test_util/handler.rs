use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time;

use crate::error::RelayError;
use crate::messaging::message::{Message, MessageId};
use crate::messaging::peer_id::PeerId;
use crate::relay::handler::SessionHandler;


/// A [SessionHandler] that records all callbacks, and allows tests to wait for them
pub struct RecordingHandler {
    received: Mutex<Vec<Message>>,
    unreachable: Mutex<Vec<(MessageId, Option<PeerId>)>>,
    disconnects: Mutex<Vec<PeerId>>,
    num_events: watch::Sender<usize>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            received: Default::default(),
            unreachable: Default::default(),
            disconnects: Default::default(),
            num_events: watch::Sender::new(0),
        })
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    /// the payloads of all received messages as text, in the order they were received
    pub fn texts(&self) -> Vec<String> {
        self.received.lock().unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).to_string())
            .collect()
    }

    /// the received messages as `(sender, text)`
    pub fn texts_with_sender(&self) -> Vec<(PeerId, String)> {
        self.received.lock().unwrap()
            .iter()
            .map(|m| (m.sender().clone(), String::from_utf8_lossy(m.payload()).to_string()))
            .collect()
    }

    pub fn unreachable(&self) -> Vec<(MessageId, Option<PeerId>)> {
        self.unreachable.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<PeerId> {
        self.disconnects.lock().unwrap().clone()
    }

    /// Waits until `condition` holds, re-checking it after every callback. Returns `false` if it
    ///  does not hold within `timeout`.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&RecordingHandler) -> bool) -> bool {
        let mut events = self.num_events.subscribe();
        time::timeout(timeout, events.wait_for(|_| condition(self)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub async fn wait_for_texts(&self, n: usize, timeout: Duration) -> Vec<String> {
        self.wait_until(timeout, |h| h.received.lock().unwrap().len() >= n).await;
        self.texts()
    }

    fn notify(&self) {
        self.num_events.send_modify(|n| *n += 1);
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn on_message(&self, _from: &PeerId, message: &Message) -> Result<(), RelayError> {
        self.received.lock().unwrap().push(message.clone());
        self.notify();
        Ok(())
    }

    async fn on_unreachable(&self, id: MessageId, target: Option<PeerId>) {
        self.unreachable.lock().unwrap().push((id, target));
        self.notify();
    }

    async fn on_disconnect(&self, peer: &PeerId) {
        self.disconnects.lock().unwrap().push(peer.clone());
        self.notify();
    }
}
