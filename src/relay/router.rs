use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::messaging::message::{Message, MessageId};
use crate::messaging::peer_id::PeerId;
use crate::relay::handler::SessionHandler;
use crate::relay::session::Outbound;


/// An admitted peer: its session's outbound queue, and the token that cancels the session
struct PeerEntry {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl PeerEntry {
    /// Never waits for queue space. A peer whose queue is full does not keep up with what is
    ///  relayed to it, so its session is cancelled and it is treated as unreachable.
    fn offer(&self, peer: &PeerId, item: Outbound) -> Result<(), RelayError> {
        match self.outbound.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("outbound queue of {} is full - disconnecting it", peer);
                self.cancel.cancel();
                Err(RelayError::PeerUnreachable(peer.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::PeerUnreachable(peer.clone())),
        }
    }
}

/// The relay server's map of active peers, and the [SessionHandler] of all server side sessions.
///
/// DATA with a target is forwarded into that peer's outbound queue, DATA without a target goes to
///  every other peer. The forwarded message's sender is the id the originating peer registered
///  with, regardless of what it put into the frame.
///
/// Forwarding never blocks the session doing it: a peer that stops reading is disconnected once
///  its outbound queue is full, and the others carry on.
pub struct RelayRouter {
    peers: RwLock<FxHashMap<PeerId, PeerEntry>>,
    welcome_message: Option<String>,
    /// gets to see every message, unreachable notification and disconnect the router handles
    observer: Option<Arc<dyn SessionHandler>>,
}

impl RelayRouter {
    pub fn new(welcome_message: Option<String>, observer: Option<Arc<dyn SessionHandler>>) -> RelayRouter {
        RelayRouter {
            peers: Default::default(),
            welcome_message,
            observer,
        }
    }

    /// Adds a peer after its HELLO, returning the reason for rejecting it if the name can not be
    ///  used. `cancel` ends the peer's session if it falls behind.
    pub async fn admit(&self, peer: &PeerId, outbound: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Result<(), String> {
        if peer.is_server() {
            return Err(format!("Username '{}' is reserved. Please choose a different username.", peer));
        }

        match self.peers.write().await.entry(peer.clone()) {
            Entry::Occupied(_) => Err(format!("Username '{}' already taken. Please choose a different username.", peer)),
            Entry::Vacant(e) => {
                e.insert(PeerEntry { outbound, cancel });
                Ok(())
            }
        }
    }

    /// Sends the welcome message to a newly admitted peer, and tells all others that it joined
    pub async fn announce_join(&self, peer: &PeerId) {
        info!("{} joined", peer);
        if let Some(welcome) = &self.welcome_message {
            if let Err(e) = self.send_to(peer, Bytes::from(welcome.clone())).await {
                debug!("no welcome for {}: {}", peer, e);
            }
        }
        self.broadcast(peer, &PeerId::server(), Bytes::from(format!("'{}' has joined the chat!", peer))).await;
    }

    /// Sends a message from the relay server itself to a single peer
    pub async fn send_to(&self, peer: &PeerId, payload: Bytes) -> Result<(), RelayError> {
        match self.peers.read().await.get(peer) {
            Some(entry) => entry.offer(peer, Outbound::relayed(PeerId::server(), Some(peer.clone()), payload)),
            None => Err(RelayError::PeerUnreachable(peer.clone())),
        }
    }

    /// Removes a peer, announcing it to the remaining peers if it was admitted
    pub async fn remove(&self, peer: &PeerId) {
        if self.peers.write().await.remove(peer).is_some() {
            info!("{} left", peer);
            self.broadcast(peer, &PeerId::server(), Bytes::from(format!("'{}' has left the chat.", peer))).await;
        }
    }

    /// Removes a peer that was admitted but never became active, without telling anybody
    pub async fn discard(&self, peer: &PeerId) {
        self.peers.write().await.remove(peer);
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut result = self.peers.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn relay(&self, from: &PeerId, message: &Message) -> Result<(), RelayError> {
        match message.target() {
            Some(target) => {
                let peers = self.peers.read().await;
                let Some(entry) = peers.get(target) else {
                    debug!("no session for {:?}", target);
                    return Err(RelayError::PeerUnreachable(target.clone()));
                };
                entry.offer(target, Outbound::relayed(from.clone(), Some(target.clone()), message.payload().clone()))
            }
            None => {
                self.broadcast(from, from, message.payload().clone()).await;
                Ok(())
            }
        }
    }

    /// sends to all peers except `excluded`
    async fn broadcast(&self, excluded: &PeerId, sender: &PeerId, payload: Bytes) {
        for (id, entry) in self.peers.read().await.iter() {
            if id == excluded {
                continue;
            }
            if let Err(e) = entry.offer(id, Outbound::relayed(sender.clone(), None, payload.clone())) {
                debug!("broadcast skips {:?}: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl SessionHandler for RelayRouter {
    async fn on_message(&self, from: &PeerId, message: &Message) -> Result<(), RelayError> {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_message(from, message).await {
                warn!("observer failed to handle {:?}: {}", message, e);
            }
        }
        self.relay(from, message).await
    }

    async fn on_unreachable(&self, id: MessageId, target: Option<PeerId>) {
        // clients do not relay, so this is a peer misbehaving rather than anything to act on
        debug!("peer reported {:?} as unreachable for {:?}", target, id);
        if let Some(observer) = &self.observer {
            observer.on_unreachable(id, target).await;
        }
    }

    async fn on_disconnect(&self, peer: &PeerId) {
        self.remove(peer).await;
        if let Some(observer) = &self.observer {
            observer.on_disconnect(peer).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use crate::test_util::handler::RecordingHandler;
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    async fn admitted(router: &RelayRouter, name: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        router.admit(&peer(name), tx, CancellationToken::new()).await.unwrap();
        rx
    }

    fn text(outbound: &Outbound) -> &str {
        std::str::from_utf8(outbound.payload()).unwrap()
    }

    #[tokio::test]
    async fn test_admit() {
        let router = RelayRouter::new(None, None);
        let _alice = admitted(&router, "alice").await;

        let (tx, _rx) = mpsc::channel(1);
        let reason = router.admit(&peer("alice"), tx.clone(), CancellationToken::new()).await.unwrap_err();
        assert!(reason.contains("already taken"));
        assert!(router.admit(&PeerId::server(), tx.clone(), CancellationToken::new()).await.is_err());

        router.admit(&peer("bob"), tx, CancellationToken::new()).await.unwrap();
        assert_eq!(router.connected_peers().await, vec![peer("alice"), peer("bob")]);

        router.remove(&peer("alice")).await;
        router.remove(&peer("alice")).await;
        assert_eq!(router.connected_peers().await, vec![peer("bob")]);
    }

    #[tokio::test]
    async fn test_relay_to_target() {
        let router = RelayRouter::new(None, None);
        let mut alice = admitted(&router, "alice").await;
        let mut bob = admitted(&router, "bob").await;

        // the sender claimed in the frame is ignored
        let msg = Message::data(MessageId(5), peer("mallory"), Some(peer("bob")), "hi bob");
        router.relay(&peer("alice"), &msg).await.unwrap();

        let relayed = bob.try_recv().unwrap();
        assert_eq!(relayed.sender(), Some(&peer("alice")));
        assert_eq!(relayed.target(), Some(&peer("bob")));
        assert_eq!(text(&relayed), "hi bob");
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_to_unknown_target() {
        let router = RelayRouter::new(None, None);
        let _alice = admitted(&router, "alice").await;

        let msg = Message::data(MessageId(1), peer("alice"), Some(peer("carol")), "hi carol");
        assert!(matches!(router.relay(&peer("alice"), &msg).await, Err(RelayError::PeerUnreachable(p)) if p == peer("carol")));
    }

    #[tokio::test]
    async fn test_relay_to_closed_session() {
        let router = RelayRouter::new(None, None);
        let bob = admitted(&router, "bob").await;
        drop(bob);

        let msg = Message::data(MessageId(1), peer("alice"), Some(peer("bob")), "hi bob");
        assert!(matches!(router.relay(&peer("alice"), &msg).await, Err(RelayError::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let router = RelayRouter::new(None, None);
        let mut alice = admitted(&router, "alice").await;
        let mut bob = admitted(&router, "bob").await;
        let mut carol = admitted(&router, "carol").await;

        router.relay(&peer("alice"), &Message::data(MessageId(1), peer("alice"), None, "hi all")).await.unwrap();

        assert!(alice.try_recv().is_err());
        for rx in [&mut bob, &mut carol] {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.sender(), Some(&peer("alice")));
            assert_eq!(msg.target(), None);
            assert_eq!(text(&msg), "hi all");
        }
    }

    #[tokio::test]
    async fn test_join_and_leave_notices() {
        let router = RelayRouter::new(Some("welcome!".to_string()), None);
        let mut alice = admitted(&router, "alice").await;
        router.announce_join(&peer("alice")).await;

        let welcome = alice.try_recv().unwrap();
        assert_eq!(welcome.sender(), Some(&PeerId::server()));
        assert_eq!(text(&welcome), "welcome!");
        assert!(alice.try_recv().is_err());

        let mut bob = admitted(&router, "bob").await;
        router.announce_join(&peer("bob")).await;
        assert_eq!(text(&alice.try_recv().unwrap()), "'bob' has joined the chat!");
        assert_eq!(text(&bob.try_recv().unwrap()), "welcome!");

        router.on_disconnect(&peer("bob")).await;
        let notice = alice.try_recv().unwrap();
        assert_eq!(notice.sender(), Some(&PeerId::server()));
        assert_eq!(text(&notice), "'bob' has left the chat.");
    }

    #[tokio::test]
    async fn test_observer() {
        let observer = RecordingHandler::new();
        let router = RelayRouter::new(None, Some(observer.clone()));
        let _alice = admitted(&router, "alice").await;

        let msg = Message::data(MessageId(1), peer("alice"), Some(peer("carol")), "hi carol");
        assert!(router.on_message(&peer("alice"), &msg).await.is_err());
        router.on_disconnect(&peer("alice")).await;

        assert_eq!(observer.texts(), vec!["hi carol".to_string()]);
        assert_eq!(observer.disconnects(), vec![peer("alice")]);
    }

    #[tokio::test]
    async fn test_slow_peer_is_disconnected() {
        let router = RelayRouter::new(None, None);
        let mut alice = admitted(&router, "alice").await;
        let (tx, _bob_queue) = mpsc::channel(1);
        let bob_cancel = CancellationToken::new();
        router.admit(&peer("bob"), tx, bob_cancel.clone()).await.unwrap();

        let to_bob = |text: &'static str| Message::data(MessageId(1), peer("carol"), Some(peer("bob")), text);
        router.relay(&peer("carol"), &to_bob("first")).await.unwrap();
        assert!(!bob_cancel.is_cancelled());

        // bob's queue is full: the sender is told right away instead of waiting for space
        assert!(matches!(router.relay(&peer("carol"), &to_bob("second")).await, Err(RelayError::PeerUnreachable(p)) if p == peer("bob")));
        assert!(bob_cancel.is_cancelled());

        // broadcasts still reach everybody else
        router.relay(&peer("carol"), &Message::data(MessageId(2), peer("carol"), None, "hi all")).await.unwrap();
        assert_eq!(text(&alice.try_recv().unwrap()), "hi all");
    }

    #[tokio::test]
    async fn test_send_to() {
        let router = RelayRouter::new(None, None);
        let mut alice = admitted(&router, "alice").await;

        router.send_to(&peer("alice"), Bytes::from_static(b"how are you?")).await.unwrap();
        let msg = alice.try_recv().unwrap();
        assert_eq!(msg.sender(), Some(&PeerId::server()));
        assert_eq!(text(&msg), "how are you?");

        assert!(matches!(router.send_to(&peer("bob"), Bytes::from_static(b"x")).await, Err(RelayError::PeerUnreachable(_))));
    }
}
