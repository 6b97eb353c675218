use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument, Span};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::messaging::peer_id::PeerId;
use crate::relay::connection::Connection;
use crate::relay::handler::SessionHandler;
use crate::relay::registry::ConnectionRegistry;
use crate::relay::session::{DeliveryResult, Outbound, PeerSession, SessionRole, SessionState, SessionStatus};


/// A connection to a relay server, driven by a single client side [PeerSession].
///
/// Inbound messages go to the [SessionHandler] passed to [ClientEndpoint::connect]; outbound
///  messages are sent through [ClientEndpoint::send], which returns their delivery outcome.
///  Dropping the endpoint cancels its session, [ClientEndpoint::close] additionally waits for it
///  to be closed.
pub struct ClientEndpoint {
    name: PeerId,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    status: SessionStatus,
    cancel: CancellationToken,
    session_task: Mutex<Option<JoinHandle<Result<(), RelayError>>>>,
}

impl ClientEndpoint {
    /// Connects to the configured server address (from the configured local bind address, if
    ///  any) and performs the HELLO handshake, announcing `name`.
    ///
    /// Any failure, including the server rejecting the name, is reported as
    ///  [RelayError::Connect], and nothing is registered with the registry in that case.
    #[instrument(name="client", skip_all, fields(name = %name))]
    pub async fn connect(
        config: &RelayConfig,
        name: PeerId,
        handler: Arc<dyn SessionHandler>,
        registry: Arc<ConnectionRegistry>,
        parent_cancel: &CancellationToken,
    ) -> Result<ClientEndpoint, RelayError> {
        let server_addr = config.server_addr;
        let connect_error = |reason: String| RelayError::Connect { addr: server_addr, reason };

        debug!("connecting to {:?}", server_addr);
        let stream = match time::timeout(config.connect_timeout, open_stream(server_addr, config.client_bind_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(e.to_string())),
            Err(_) => return Err(connect_error(format!("no connection within {:?}", config.connect_timeout))),
        };
        let (connection, reader) = Connection::new(stream, config.max_frame_len)
            .map_err(|e| connect_error(e.to_string()))?;
        let local_addr = connection.local_addr();

        let cancel = parent_cancel.child_token();
        let (mut session, outbound) = PeerSession::new(
            SessionRole::ClientSide,
            name.clone(),
            connection.clone(),
            reader,
            registry.clone(),
            handler,
            config,
            cancel.clone(),
        );

        if let Err(e) = session.send_hello(config.handshake_timeout).await {
            session.abort().await;
            return Err(match e {
                RelayError::Connect { .. } => e,
                e => connect_error(format!("handshake failed: {}", e)),
            });
        }
        registry.register(&connection).await;

        let status = session.status();
        let session_task = tokio::spawn(session.run().instrument(Span::current()));

        Ok(ClientEndpoint {
            name,
            server_addr,
            local_addr,
            outbound,
            status,
            cancel,
            session_task: Mutex::new(Some(session_task)),
        })
    }

    /// Queues a payload for sending, to `target` or (if there is no target) to all other peers
    ///  connected to the relay, and waits for the outcome.
    pub async fn send(&self, payload: impl Into<Bytes>, target: Option<PeerId>) -> DeliveryResult {
        let (item, reply) = Outbound::new(payload, target);
        self.outbound.send(item).await
            .map_err(|_| RelayError::ConnectionClosed)?;
        reply.await
            .map_err(|_| RelayError::ConnectionClosed)?
    }

    /// Cancels the session and waits until it is closed. Closing more than once is a no-op.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.cancel.cancel();

        let session_task = self.session_task.lock().await.take();
        let result = match session_task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("session task of {} failed: {}", self.name, e);
                    Err(RelayError::Io(io::Error::new(io::ErrorKind::Other, e)))
                }
            },
            None => Ok(()),
        };

        self.status.clone().wait_until_closed().await;
        result
    }

    pub fn name(&self) -> &PeerId {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }
}

impl Drop for ClientEndpoint {
    /// The session task keeps running detached, but is cancelled so that it releases the connection
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn open_stream(server_addr: SocketAddr, bind_addr: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(bind_addr) = bind_addr else {
        return TcpStream::connect(server_addr).await;
    };

    let socket = if bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    }
    else {
        TcpSocket::new_v6()?
    };
    // a fixed local port would otherwise be blocked for a while after the previous run
    socket.set_reuseaddr(true)?;
    socket.bind(bind_addr)?;
    socket.connect(server_addr).await
}
