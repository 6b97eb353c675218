use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{AckPolicy, RelayConfig};
use crate::error::RelayError;
use crate::messaging::ack_tracker::{AckOutcome, AckTracker};
use crate::messaging::frame::FrameReader;
use crate::messaging::message::{Message, MessageId, MessageKind};
use crate::messaging::peer_id::PeerId;
use crate::relay::connection::Connection;
use crate::relay::handler::SessionHandler;
use crate::relay::registry::ConnectionRegistry;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionRole {
    /// created by the relay server for an accepted connection
    ServerSide,
    /// created by a client endpoint for the connection it established
    ClientSide,
}

/// ```ascii
/// Connecting -> Active -> Closing -> Closed
///      |                     ^
///      +---------------------+   (failed handshake)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// How a queued message went out
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// written to the connection, without waiting for the ack (fire-and-forget)
    Sent(MessageId),
    Acked(MessageId),
}

pub type DeliveryResult = Result<Delivery, RelayError>;


/// A payload in a session's outbound queue
pub struct Outbound {
    payload: Bytes,
    target: Option<PeerId>,
    sender: Option<PeerId>,
    reply: Option<oneshot::Sender<DeliveryResult>>,
}

impl Outbound {
    /// A message originating at the local peer. The receiver yields the delivery outcome.
    pub fn new(payload: impl Into<Bytes>, target: Option<PeerId>) -> (Outbound, oneshot::Receiver<DeliveryResult>) {
        let (tx, rx) = oneshot::channel();
        let outbound = Outbound {
            payload: payload.into(),
            target,
            sender: None,
            reply: Some(tx),
        };
        (outbound, rx)
    }

    /// A message that the relay server forwards on behalf of `sender`. Nobody waits for its outcome.
    pub fn relayed(sender: PeerId, target: Option<PeerId>, payload: Bytes) -> Outbound {
        Outbound {
            payload,
            target,
            sender: Some(sender),
            reply: None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn target(&self) -> Option<&PeerId> {
        self.target.as_ref()
    }

    /// `None` for messages originating at the local peer
    pub fn sender(&self) -> Option<&PeerId> {
        self.sender.as_ref()
    }

    fn complete(self, result: DeliveryResult) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}


/// A read-only view of a session's lifecycle that outlives the session
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub role: SessionRole,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    state: watch::Receiver<SessionState>,
}

impl SessionStatus {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn wait_until_closed(&mut self) {
        // the sender is only dropped after the final transition to 'Closed'
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }
}


/// One connection between a client and the relay server, seen from either end.
///
/// A session starts out as [SessionState::Connecting], and the code creating it performs the
///  handshake (HELLO, answered by ACK or REJECT). After that, [PeerSession::run] drives two
///  independent loops until either of them ends or the session is cancelled:
///  * the inbound loop delivers DATA to the [SessionHandler] and acknowledges it, and correlates
///    ACK and UNREACHABLE with pending sends
///  * the outbound loop drains the outbound queue, sending each payload with a fresh id and
///    (depending on the [AckPolicy]) waiting for its ack
///
/// Both loops write through the connection's frame writer, so their frames never interleave.
pub struct PeerSession {
    role: SessionRole,
    local_id: PeerId,
    peer_id: Option<PeerId>,
    hello_id: MessageId,
    connection: Arc<Connection>,
    reader: FrameReader<OwnedReadHalf>,
    tracker: Arc<AckTracker>,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn SessionHandler>,
    outbound: mpsc::Receiver<Outbound>,
    ack_policy: AckPolicy,
    ack_window: Duration,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl PeerSession {
    /// NB: The session does not register its connection with the registry, that is up to the
    ///  caller. It does unregister it when it is finished though.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: SessionRole,
        local_id: PeerId,
        connection: Arc<Connection>,
        reader: FrameReader<OwnedReadHalf>,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn SessionHandler>,
        config: &RelayConfig,
        cancel: CancellationToken,
    ) -> (PeerSession, mpsc::Sender<Outbound>) {
        let (outbound_send, outbound_recv) = mpsc::channel(config.outbound_queue_capacity);

        let ack_policy = match role {
            SessionRole::ServerSide => config.server_ack_policy,
            SessionRole::ClientSide => config.client_ack_policy,
        };

        let session = PeerSession {
            role,
            local_id,
            peer_id: None,
            hello_id: MessageId::HELLO,
            connection,
            reader,
            tracker: Arc::new(AckTracker::new()),
            registry,
            handler,
            outbound: outbound_recv,
            ack_policy,
            ack_window: config.ack_window,
            cancel,
            state: watch::Sender::new(SessionState::Connecting),
        };
        (session, outbound_send)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            role: self.role,
            local_addr: self.connection.local_addr(),
            remote_addr: self.connection.remote_addr(),
            state: self.state.subscribe(),
        }
    }

    /// Client side of the handshake: announces the local id and waits for the server's response
    pub async fn send_hello(&mut self, timeout: Duration) -> Result<(), RelayError> {
        let hello = Message::hello(self.hello_id, self.local_id.clone());
        self.connection.send(&hello).await?;

        let response = self.receive_handshake(timeout).await?;
        match response.kind() {
            MessageKind::Ack if response.id() == self.hello_id => {
                self.peer_id = Some(response.sender().clone());
                self.state.send_replace(SessionState::Active);
                debug!("handshake complete, connected to {:?}", response.sender());
                Ok(())
            }
            MessageKind::Reject => Err(RelayError::Connect {
                addr: self.connection.remote_addr(),
                reason: format!("rejected by the server: {}", response.payload_str().unwrap_or("(no reason given)")),
            }),
            _ => Err(RelayError::Protocol(format!("expected the response to HELLO, received {:?}", response))),
        }
    }

    /// Server side of the handshake: waits for the client's HELLO and returns the id it claims.
    ///  The caller must answer with either [PeerSession::confirm_hello] or
    ///  [PeerSession::reject_hello].
    pub async fn receive_hello(&mut self, timeout: Duration) -> Result<PeerId, RelayError> {
        let hello = self.receive_handshake(timeout).await?;
        if hello.kind() != MessageKind::Hello {
            return Err(RelayError::Protocol(format!("expected HELLO, received {:?}", hello)));
        }
        self.hello_id = hello.id();
        Ok(hello.sender().clone())
    }

    pub async fn confirm_hello(&mut self, peer_id: PeerId) -> Result<(), RelayError> {
        self.connection.send(&Message::ack(self.hello_id, self.local_id.clone())).await?;
        debug!("handshake complete, {:?} connected from {:?}", peer_id, self.connection.remote_addr());
        self.peer_id = Some(peer_id);
        self.state.send_replace(SessionState::Active);
        Ok(())
    }

    pub async fn reject_hello(&mut self, reason: &str) -> Result<(), RelayError> {
        info!("rejecting connection from {:?}: {}", self.connection.remote_addr(), reason);
        self.connection.send(&Message::reject(self.hello_id, self.local_id.clone(), reason)).await
    }

    async fn receive_handshake(&mut self, timeout: Duration) -> Result<Message, RelayError> {
        let closed = self.connection.closed_token().clone();
        select! {
            _ = closed.cancelled() => Err(RelayError::ConnectionClosed),
            result = time::timeout(timeout, self.reader.receive(&self.cancel)) => match result {
                Ok(result) => result,
                Err(_) => Err(RelayError::Protocol(format!("no handshake within {:?}", timeout))),
            }
        }
    }

    /// Ends a session that never became active, e.g. after a failed handshake
    pub async fn abort(self) {
        debug!("aborting session with {:?}", self.connection.remote_addr());
        self.state.send_replace(SessionState::Closing);
        Self::release(&self.connection, &self.registry, &self.tracker, self.outbound).await;
        self.state.send_replace(SessionState::Closed);
    }

    /// Runs the session until the connection is closed (by either side), a protocol violation or
    ///  I/O error occurs, the outbound queue is closed, or the session is cancelled. Regular
    ///  termination (closed or cancelled) is reported as `Ok`.
    ///
    /// All resources are released on every exit path, and the handler's `on_disconnect` is called
    ///  after the session reached [SessionState::Closed].
    #[instrument(name="session", skip_all, fields(role = ?self.role, peer = ?self.peer_id, addr = ?self.connection.remote_addr()))]
    pub async fn run(self) -> Result<(), RelayError> {
        let PeerSession {
            role: _,
            local_id,
            peer_id,
            hello_id: _,
            connection,
            mut reader,
            tracker,
            registry,
            handler,
            mut outbound,
            ack_policy,
            ack_window,
            cancel,
            state,
        } = self;

        let peer_id = match peer_id {
            Some(peer_id) if *state.borrow() == SessionState::Active => peer_id,
            _ => {
                state.send_replace(SessionState::Closing);
                Self::release(&connection, &registry, &tracker, outbound).await;
                state.send_replace(SessionState::Closed);
                return Err(RelayError::Protocol("session was started without a handshake".to_string()));
            }
        };
        debug!("session active");

        let result = {
            let inbound_loop = Self::inbound_loop(&mut reader, &connection, &tracker, handler.as_ref(), &local_id, &peer_id, &cancel);
            let outbound_loop = Self::outbound_loop(&mut outbound, &connection, &tracker, &local_id, ack_policy, ack_window);

            select! {
                result = inbound_loop => result,
                result = outbound_loop => result,
                _ = cancel.cancelled() => Err(RelayError::Cancelled),
                _ = connection.closed_token().cancelled() => Err(RelayError::ConnectionClosed),
            }
        };

        state.send_replace(SessionState::Closing);
        match &result {
            Ok(()) => debug!("outbound queue closed, ending session"),
            Err(e) if e.is_regular_termination() => debug!("session ended: {}", e),
            Err(e) => warn!("session terminated: {}", e),
        }

        Self::release(&connection, &registry, &tracker, outbound).await;
        state.send_replace(SessionState::Closed);
        handler.on_disconnect(&peer_id).await;

        match result {
            Err(e) if !e.is_regular_termination() => Err(e),
            _ => Ok(()),
        }
    }

    async fn release(connection: &Connection, registry: &ConnectionRegistry, tracker: &AckTracker, mut outbound: mpsc::Receiver<Outbound>) {
        if let Err(e) = connection.close().await {
            debug!("error closing connection: {}", e);
        }
        registry.unregister(connection).await;
        tracker.cancel_all().await;

        outbound.close();
        while let Ok(item) = outbound.try_recv() {
            item.complete(Err(RelayError::ConnectionClosed));
        }
    }

    async fn inbound_loop(
        reader: &mut FrameReader<OwnedReadHalf>,
        connection: &Connection,
        tracker: &AckTracker,
        handler: &dyn SessionHandler,
        local_id: &PeerId,
        peer_id: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        loop {
            let message = reader.receive(cancel).await?;

            match message.kind() {
                MessageKind::Data => {
                    let response = match handler.on_message(peer_id, &message).await {
                        Ok(()) => Message::ack(message.id(), local_id.clone()),
                        Err(RelayError::PeerUnreachable(target)) => {
                            debug!("{:?} from {:?} can not be delivered: no session for {:?}", message.id(), peer_id, target);
                            Message::unreachable(message.id(), local_id.clone(), target)
                        }
                        Err(e) => {
                            warn!("error handling {:?}: {} - acknowledging anyway", message, e);
                            Message::ack(message.id(), local_id.clone())
                        }
                    };
                    connection.send(&response).await?;
                }
                MessageKind::Ack => {
                    tracker.resolve(message.id()).await;
                }
                MessageKind::Unreachable => {
                    tracker.reject(message.id()).await;
                    handler.on_unreachable(message.id(), message.target().cloned()).await;
                }
                MessageKind::Hello | MessageKind::Reject => {
                    return Err(RelayError::Protocol(format!("unexpected {:?} after the handshake", message)));
                }
            }
        }
    }

    async fn outbound_loop(
        outbound: &mut mpsc::Receiver<Outbound>,
        connection: &Connection,
        tracker: &Arc<AckTracker>,
        local_id: &PeerId,
        ack_policy: AckPolicy,
        ack_window: Duration,
    ) -> Result<(), RelayError> {
        let mut next_id = MessageId::FIRST;

        while let Some(item) = outbound.recv().await {
            let id = next_id;
            next_id = next_id.next();

            let sender = item.sender.clone()
                .unwrap_or_else(|| local_id.clone());
            let message = Message::data(id, sender, item.target.clone(), item.payload.clone());

            // tracking before sending: the ack may arrive before `send` returns
            let handle = tracker.track(id, ack_window).await?;

            match connection.send(&message).await {
                Ok(()) => {}
                Err(RelayError::Protocol(reason)) => {
                    // the message was rejected before anything was written, so the session can go on
                    warn!("not sending {:?}: {}", message, reason);
                    tracker.forget(id).await;
                    item.complete(Err(RelayError::Protocol(reason)));
                    continue;
                }
                Err(e) => {
                    item.complete(Err(RelayError::ConnectionClosed));
                    return Err(e);
                }
            }

            match ack_policy {
                AckPolicy::FireAndForget => {
                    item.complete(Ok(Delivery::Sent(id)));
                    tracker.purge_older_than(ack_window).await;
                }
                AckPolicy::WaitForAck => {
                    let result = match handle.wait().await {
                        AckOutcome::Acked => {
                            trace!("{:?} was acknowledged", id);
                            Ok(Delivery::Acked(id))
                        }
                        AckOutcome::Unreachable => Err(RelayError::PeerUnreachable(item.target.clone()
                            .unwrap_or_else(PeerId::server))),
                        AckOutcome::Timeout => {
                            warn!("{:?} was not acknowledged within {:?} - not resending", id, ack_window);
                            Err(RelayError::AckTimeout { id, window: ack_window })
                        }
                        AckOutcome::Closed => Err(RelayError::ConnectionClosed),
                    };
                    item.complete(result);
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use crate::relay::handler::MockSessionHandler;
    use crate::test_util::handler::RecordingHandler;
    use crate::test_util::wire::RawPeer;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn config() -> RelayConfig {
        RelayConfig::new("127.0.0.1:0".parse().unwrap())
    }

    /// a session under test, connected to a raw frame-level peer on the other end of a loopback connection
    async fn session_with_raw_peer(role: SessionRole, local_id: &str, handler: Arc<dyn SessionHandler>, config: &RelayConfig) -> (PeerSession, mpsc::Sender<Outbound>, RawPeer, Arc<ConnectionRegistry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, reader) = Connection::new(stream, config.max_frame_len).unwrap();
        registry.register(&connection).await;

        let (session, outbound) = PeerSession::new(role, peer(local_id), connection, reader, registry.clone(), handler, config, CancellationToken::new());
        (session, outbound, RawPeer::new(accepted), registry)
    }

    /// the session acts as the server side, the raw peer as a client named 'alice'
    async fn active_server_side(handler: Arc<dyn SessionHandler>, config: &RelayConfig) -> (SessionStatus, mpsc::Sender<Outbound>, RawPeer, Arc<ConnectionRegistry>, JoinHandle<Result<(), RelayError>>) {
        let (mut session, outbound, mut raw, registry) = session_with_raw_peer(SessionRole::ServerSide, PeerId::SERVER, handler, config).await;

        raw.send(&Message::hello(MessageId::HELLO, peer("alice"))).await;
        assert_eq!(session.receive_hello(TIMEOUT).await.unwrap(), peer("alice"));
        session.confirm_hello(peer("alice")).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        let ack = raw.receive().await.unwrap();
        assert_eq!(ack.kind(), MessageKind::Ack);
        assert_eq!(ack.id(), MessageId::HELLO);

        let status = session.status();
        let join_handle = tokio::spawn(session.run());
        (status, outbound, raw, registry, join_handle)
    }

    #[tokio::test]
    async fn test_every_data_message_is_acked_in_order() {
        let handler = RecordingHandler::new();
        let (mut status, _outbound, mut raw, registry, join_handle) = active_server_side(handler.clone(), &config()).await;

        for i in 1..=20 {
            raw.send(&Message::data(MessageId(i), peer("alice"), None, format!("message {}", i))).await;
        }
        for i in 1..=20 {
            let ack = raw.receive().await.unwrap();
            assert_eq!(ack.kind(), MessageKind::Ack);
            assert_eq!(ack.id(), MessageId(i));
        }

        let texts = handler.texts();
        assert_eq!(texts.len(), 20);
        assert_eq!(texts[0], "message 1");
        assert_eq!(texts[19], "message 20");

        raw.close().await;
        join_handle.await.unwrap().unwrap();
        status.wait_until_closed().await;
        assert_eq!(status.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
        assert_eq!(handler.disconnects(), vec![peer("alice")]);
    }

    #[tokio::test]
    async fn test_handler_reports_unreachable_target() {
        let mut handler = MockSessionHandler::new();
        handler.expect_on_message()
            .returning(|_, _| Err(RelayError::PeerUnreachable(PeerId::new("carol").unwrap())));
        handler.expect_on_disconnect()
            .with(eq(peer("alice")))
            .times(1)
            .returning(|_| ());

        let (_status, _outbound, mut raw, _registry, join_handle) = active_server_side(Arc::new(handler), &config()).await;

        raw.send(&Message::data(MessageId(7), peer("alice"), Some(peer("carol")), "hi carol")).await;
        let response = raw.receive().await.unwrap();
        assert_eq!(response.kind(), MessageKind::Unreachable);
        assert_eq!(response.id(), MessageId(7));
        assert_eq!(response.target(), Some(&peer("carol")));

        raw.close().await;
        join_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let handler = RecordingHandler::new();
        let (_status, outbound, mut raw, _registry, join_handle) = active_server_side(handler.clone(), &config()).await;

        let (item, reply) = Outbound::new("first", None);
        outbound.send(item).await.unwrap();
        assert_eq!(reply.await.unwrap().unwrap(), Delivery::Sent(MessageId(1)));

        outbound.send(Outbound::relayed(peer("bob"), Some(peer("alice")), Bytes::from_static(b"from bob"))).await.unwrap();

        let first = raw.receive().await.unwrap();
        assert_eq!(first.id(), MessageId(1));
        assert_eq!(first.sender(), &peer("server"));
        assert_eq!(first.payload_str(), Some("first"));

        let relayed = raw.receive().await.unwrap();
        assert_eq!(relayed.id(), MessageId(2));
        assert_eq!(relayed.sender(), &peer("bob"));
        assert_eq!(relayed.target(), Some(&peer("alice")));

        drop(outbound);
        join_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_session() {
        let handler = RecordingHandler::new();
        let (mut status, _outbound, mut raw, registry, join_handle) = active_server_side(handler.clone(), &config()).await;

        raw.send_raw(b"\0\0\0\x07garbage").await;

        assert!(matches!(join_handle.await.unwrap(), Err(RelayError::Protocol(_))));
        status.wait_until_closed().await;
        assert!(registry.is_empty().await);
        assert_eq!(handler.disconnects(), vec![peer("alice")]);
        assert!(matches!(raw.receive().await, Err(RelayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_hello_after_handshake_is_protocol_violation() {
        let handler = RecordingHandler::new();
        let (_status, _outbound, mut raw, _registry, join_handle) = active_server_side(handler.clone(), &config()).await;

        raw.send(&Message::hello(MessageId::HELLO, peer("alice"))).await;
        assert!(matches!(join_handle.await.unwrap(), Err(RelayError::Protocol(_))));
    }

    /// the session acts as a client named 'alice', the raw peer as the server
    async fn active_client_side(handler: Arc<dyn SessionHandler>, config: &RelayConfig) -> (SessionStatus, mpsc::Sender<Outbound>, RawPeer, CancellationToken, JoinHandle<Result<(), RelayError>>) {
        let (mut session, outbound, mut raw, _registry) = session_with_raw_peer(SessionRole::ClientSide, "alice", handler, config).await;
        let cancel = session.cancel.clone();

        let server = tokio::spawn(async move {
            let hello = raw.receive().await.unwrap();
            assert_eq!(hello.kind(), MessageKind::Hello);
            assert_eq!(hello.sender(), &peer("alice"));
            raw.send(&Message::ack(hello.id(), PeerId::server())).await;
            raw
        });
        session.send_hello(TIMEOUT).await.unwrap();
        let raw = server.await.unwrap();

        assert_eq!(session.peer_id(), Some(&PeerId::server()));
        let status = session.status();
        (status, outbound, raw, cancel, tokio::spawn(session.run()))
    }

    #[tokio::test]
    async fn test_wait_for_ack() {
        let handler = RecordingHandler::new();
        let (_status, outbound, mut raw, _cancel, _join_handle) = active_client_side(handler.clone(), &config()).await;

        let (item, reply) = Outbound::new("ping", None);
        outbound.send(item).await.unwrap();

        let data = raw.receive().await.unwrap();
        assert_eq!(data.id(), MessageId(1));
        assert_eq!(data.payload_str(), Some("ping"));
        raw.send(&Message::ack(data.id(), PeerId::server())).await;

        assert_eq!(reply.await.unwrap().unwrap(), Delivery::Acked(MessageId(1)));
    }

    #[tokio::test]
    async fn test_unreachable_reported_to_sender() {
        let handler = RecordingHandler::new();
        let (_status, outbound, mut raw, _cancel, _join_handle) = active_client_side(handler.clone(), &config()).await;

        let (item, reply) = Outbound::new("hi carol", Some(peer("carol")));
        outbound.send(item).await.unwrap();

        let data = raw.receive().await.unwrap();
        raw.send(&Message::unreachable(data.id(), PeerId::server(), peer("carol"))).await;

        assert!(matches!(reply.await.unwrap(), Err(RelayError::PeerUnreachable(p)) if p == peer("carol")));
        assert!(handler.wait_until(TIMEOUT, |h| !h.unreachable().is_empty()).await);
        assert_eq!(handler.unreachable(), vec![(data.id(), Some(peer("carol")))]);
    }

    #[tokio::test]
    async fn test_ack_timeout_is_not_retried() {
        let handler = RecordingHandler::new();
        let config = RelayConfig {
            ack_window: Duration::from_millis(100),
            ..config()
        };
        let (_status, outbound, mut raw, _cancel, _join_handle) = active_client_side(handler.clone(), &config).await;

        let (item, reply) = Outbound::new("anybody there?", None);
        outbound.send(item).await.unwrap();
        assert!(matches!(reply.await.unwrap(), Err(RelayError::AckTimeout { id: MessageId(1), .. })));

        // a late ack is ignored, and nothing is resent
        raw.send(&Message::ack(MessageId(1), PeerId::server())).await;
        let (item, reply) = Outbound::new("second", None);
        outbound.send(item).await.unwrap();

        let first = raw.receive().await.unwrap();
        assert_eq!(first.id(), MessageId(1));
        let second = raw.receive().await.unwrap();
        assert_eq!(second.id(), MessageId(2));
        raw.send(&Message::ack(MessageId(2), PeerId::server())).await;
        assert_eq!(reply.await.unwrap().unwrap(), Delivery::Acked(MessageId(2)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let handler = RecordingHandler::new();
        let (mut status, outbound, mut raw, cancel, join_handle) = active_client_side(handler.clone(), &config()).await;

        cancel.cancel();
        join_handle.await.unwrap().unwrap();
        status.wait_until_closed().await;

        assert!(matches!(raw.receive().await, Err(RelayError::ConnectionClosed)));
        assert_eq!(handler.disconnects(), vec![PeerId::server()]);

        let (item, reply) = Outbound::new("too late", None);
        assert!(outbound.send(item).await.is_err());
        assert!(reply.await.is_err());
    }

    #[tokio::test]
    async fn test_hello_rejected() {
        let handler = RecordingHandler::new();
        let (mut session, _outbound, mut raw, registry) = session_with_raw_peer(SessionRole::ClientSide, "alice", handler, &config()).await;

        let server = tokio::spawn(async move {
            let hello = raw.receive().await.unwrap();
            raw.send(&Message::reject(hello.id(), PeerId::server(), "name 'alice' is already taken")).await;
            raw
        });

        let result = session.send_hello(TIMEOUT).await;
        assert!(matches!(&result, Err(RelayError::Connect { reason, .. }) if reason.contains("already taken")));
        let _raw = server.await.unwrap();

        let status = session.status();
        session.abort().await;
        assert_eq!(status.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_run_without_handshake() {
        let handler = RecordingHandler::new();
        let (session, _outbound, _raw, registry) = session_with_raw_peer(SessionRole::ServerSide, PeerId::SERVER, handler.clone(), &config()).await;

        assert!(matches!(session.run().await, Err(RelayError::Protocol(_))));
        assert!(registry.is_empty().await);
        assert!(handler.disconnects().is_empty());
    }
}
