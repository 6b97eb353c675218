use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::messaging::peer_id::PeerId;
use crate::relay::connection::{Connection, ConnectionId};
use crate::relay::handler::SessionHandler;
use crate::relay::registry::ConnectionRegistry;
use crate::relay::router::RelayRouter;
use crate::relay::session::{Outbound, PeerSession, SessionRole, SessionStatus};


/// Accepts client connections and runs a server side [PeerSession] for each of them, relaying
///  messages between them through a [RelayRouter].
///
/// The accept loop is independent of the sessions: whatever happens in a session (protocol
///  violations, I/O errors, the peer disappearing) ends that session only.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RelayRouter>,
    sessions: Mutex<SessionBook>,
}

/// The sessions that are still running, and the most recent closed ones
#[derive(Default)]
struct SessionBook {
    live: FxHashMap<ConnectionId, SessionStatus>,
    closed: VecDeque<SessionStatus>,
}

impl RelayServer {
    pub fn new(config: Arc<RelayConfig>, registry: Arc<ConnectionRegistry>) -> Arc<RelayServer> {
        Self::create(config, registry, None)
    }

    /// The observer is called for every message, unreachable report and disconnect on the server
    ///  side, in addition to the relaying itself
    pub fn with_observer(config: Arc<RelayConfig>, registry: Arc<ConnectionRegistry>, observer: Arc<dyn SessionHandler>) -> Arc<RelayServer> {
        Self::create(config, registry, Some(observer))
    }

    fn create(config: Arc<RelayConfig>, registry: Arc<ConnectionRegistry>, observer: Option<Arc<dyn SessionHandler>>) -> Arc<RelayServer> {
        let router = Arc::new(RelayRouter::new(config.welcome_message.clone(), observer));
        Arc::new(RelayServer {
            config,
            registry,
            router,
            sessions: Default::default(),
        })
    }

    /// Binds a listening socket with SO_REUSEADDR, so that a server can be restarted on the same
    ///  port right away
    pub fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        }
        else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    /// Binds `addr` and accepts connections until `cancel` is cancelled
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = Self::bind(addr)?;
        self.serve(listener, cancel).await
    }

    /// Accepts connections on a bound listener until `cancel` is cancelled, and then waits for all
    ///  sessions to terminate. Each session gets a child token of `cancel`.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("relay server listening on {:?}", listener.local_addr()?);

        let mut session_tasks = JoinSet::new();
        loop {
            select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        let session_cancel = cancel.child_token();
                        session_tasks.spawn(async move {
                            server.handle_connection(stream, addr, session_cancel).await
                        });
                    }
                    Err(e) => {
                        // e.g. running out of file descriptors - backing off rather than spinning
                        warn!("error accepting connection: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = session_tasks.join_next(), if !session_tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        debug!("accept loop cancelled, waiting for {} sessions to terminate", session_tasks.len());
        while let Some(joined) = session_tasks.join_next().await {
            if let Err(e) = joined {
                error!("session task failed: {}", e);
            }
        }
        info!("relay server stopped");
        Ok(())
    }

    #[instrument(name="accepted_connection", skip_all, fields(addr = ?addr))]
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        debug!("accepted connection");
        let (connection, reader) = match Connection::new(stream, self.config.max_frame_len) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not set up connection: {}", e);
                return;
            }
        };
        self.registry.register(&connection).await;
        let connection_id = connection.id();
        let closed = connection.closed_token().clone();

        let (session, outbound) = PeerSession::new(
            SessionRole::ServerSide,
            PeerId::server(),
            connection,
            reader,
            self.registry.clone(),
            self.router.clone(),
            &self.config,
            cancel.clone(),
        );
        self.sessions.lock().await.live.insert(connection_id, session.status());

        self.drive_session(session, outbound, cancel, closed).await;
        self.retire_session(connection_id).await;
    }

    async fn drive_session(&self, mut session: PeerSession, outbound: mpsc::Sender<Outbound>, cancel: CancellationToken, closed: CancellationToken) {
        let peer = match session.receive_hello(self.config.handshake_timeout).await {
            Ok(peer) => peer,
            Err(RelayError::Protocol(reason)) => {
                let _ = session.reject_hello(&format!("invalid HELLO: {}", reason)).await;
                session.abort().await;
                return;
            }
            Err(e) => {
                debug!("no handshake: {}", e);
                session.abort().await;
                return;
            }
        };

        if let Err(reason) = self.router.admit(&peer, outbound, cancel.clone()).await {
            let _ = session.reject_hello(&reason).await;
            session.abort().await;
            return;
        }
        if let Err(e) = session.confirm_hello(peer.clone()).await {
            debug!("connection broke during handshake: {}", e);
            self.router.discard(&peer).await;
            session.abort().await;
            return;
        }
        self.router.announce_join(&peer).await;

        let (result, _) = tokio::join!(session.run(), self.play_script(&peer, &cancel, &closed));
        if let Err(e) = result {
            debug!("session with {} ended with an error: {}", peer, e);
        }
    }

    /// sends the configured server script to a peer, until the script ends or the session does
    async fn play_script(&self, peer: &PeerId, cancel: &CancellationToken, closed: &CancellationToken) {
        for line in &self.config.server_script {
            select! {
                _ = time::sleep(self.config.server_script_pause) => {}
                _ = cancel.cancelled() => return,
                _ = closed.cancelled() => return,
            }
            if let Err(e) = self.router.send_to(peer, Bytes::from(line.clone())).await {
                debug!("stopping the script for {}: {}", peer, e);
                return;
            }
        }
    }

    /// moves a finished session's status from the live sessions to the bounded history
    async fn retire_session(&self, connection_id: ConnectionId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(status) = sessions.live.remove(&connection_id) {
            sessions.closed.push_back(status);
        }
        while sessions.closed.len() > self.config.closed_session_history {
            sessions.closed.pop_front();
        }
    }

    /// The status of every running session, plus the most recently closed ones (as many as
    ///  configured in [RelayConfig::closed_session_history])
    pub async fn session_states(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().await;
        sessions.closed.iter()
            .chain(sessions.live.values())
            .cloned()
            .collect()
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.lock().await.live.len()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.router.connected_peers().await
    }
}
