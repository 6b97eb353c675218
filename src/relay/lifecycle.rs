use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{DemoClientConfig, RelayConfig};
use crate::messaging::peer_id::PeerId;
use crate::relay::client::ClientEndpoint;
use crate::relay::handler::LoggingHandler;
use crate::relay::registry::{CloseFailure, ConnectionRegistry};
use crate::relay::server::RelayServer;
use crate::relay::session::{SessionRole, SessionState, SessionStatus};


/// When [LifecycleController::run] shuts everything down
#[derive(Copy, Clone, Debug)]
pub enum Shutdown {
    /// after a fixed duration, or earlier if the controller is cancelled
    After(Duration),
    /// when the controller is cancelled
    OnCancel,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionReport {
    pub role: SessionRole,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
}

impl From<&SessionStatus> for SessionReport {
    fn from(value: &SessionStatus) -> Self {
        SessionReport {
            role: value.role,
            local_addr: value.local_addr,
            remote_addr: value.remote_addr,
            state: value.state(),
        }
    }
}

#[derive(Debug)]
pub struct LifecycleReport {
    /// all sessions that were created during the run, server and client side
    pub sessions: Vec<SessionReport>,
    pub close_failures: Vec<CloseFailure>,
    /// connections still registered after shutdown - should always be zero
    pub remaining_connections: usize,
}


/// Starts the relay server and the configured demo clients, runs them until shutdown, and then
///  tears everything down: all tasks are cancelled and awaited, and all connections closed.
///
/// The controller owns the connection registry that server and clients share. A controller's
///  cancellation token can only fire once, so it runs once.
pub struct LifecycleController {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl LifecycleController {
    pub fn new(config: RelayConfig) -> anyhow::Result<LifecycleController> {
        config.validate()?;

        Ok(LifecycleController {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Cancelling this token (or any clone of it) shuts down a running controller
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the configured server address and runs until `shutdown`
    pub async fn run(&self, shutdown: Shutdown) -> anyhow::Result<LifecycleReport> {
        let listener = RelayServer::bind(self.config.server_addr)?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Same as [LifecycleController::run], but on a listener that is bound already. Demo clients
    ///  connect to the listener's actual address.
    pub async fn run_with_listener(&self, listener: TcpListener, shutdown: Shutdown) -> anyhow::Result<LifecycleReport> {
        let server_addr = listener.local_addr()?;
        let server = RelayServer::new(self.config.clone(), self.registry.clone());

        let mut tasks: JoinSet<anyhow::Result<Vec<SessionStatus>>> = JoinSet::new();
        {
            let server = server.clone();
            let server_cancel = self.cancel.child_token();
            tasks.spawn(async move {
                server.serve(listener, server_cancel).await?;
                Ok(server.session_states().await)
            });
        }

        for demo_client in &self.config.demo_clients {
            let client_config = RelayConfig {
                server_addr,
                client_bind_addr: demo_client.bind_addr,
                ..(*self.config).clone()
            };
            tasks.spawn(run_demo_client(client_config, demo_client.clone(), self.registry.clone(), self.cancel.child_token()));
        }

        match shutdown {
            Shutdown::After(duration) => select! {
                _ = time::sleep(duration) => info!("shutting down after {:?}", duration),
                _ = self.cancel.cancelled() => info!("cancelled, shutting down"),
            },
            Shutdown::OnCancel => {
                self.cancel.cancelled().await;
                info!("cancelled, shutting down");
            }
        }

        self.cancel.cancel();
        let close_failures = self.registry.close_all().await;

        let mut sessions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(statuses)) => sessions.extend(statuses.iter().map(SessionReport::from)),
                Ok(Err(e)) => warn!("task terminated with an error: {}", e),
                Err(e) => error!("task failed: {}", e),
            }
        }

        let remaining_connections = self.registry.len().await;
        if remaining_connections > 0 {
            warn!("{} connections still registered after shutdown", remaining_connections);
        }
        info!("shutdown complete: {} sessions, {} close failures", sessions.len(), close_failures.len());

        Ok(LifecycleReport {
            sessions,
            close_failures,
            remaining_connections,
        })
    }
}

/// connects, sends the script, and then stays connected until cancelled
#[instrument(name="demo_client", skip_all, fields(name = %demo.name))]
async fn run_demo_client(config: RelayConfig, demo: DemoClientConfig, registry: Arc<ConnectionRegistry>, cancel: CancellationToken) -> anyhow::Result<Vec<SessionStatus>> {
    let name = PeerId::new(demo.name.as_str())?;
    let handler = Arc::new(LoggingHandler { name: demo.name.clone() });

    let client = select! {
        client = ClientEndpoint::connect(&config, name, handler, registry, &cancel) => client?,
        _ = cancel.cancelled() => return Ok(Vec::new()),
    };
    let status = client.status();

    for line in &demo.script {
        select! {
            _ = time::sleep(demo.pause) => {}
            _ = cancel.cancelled() => break,
        }
        match client.send(line.clone(), None).await {
            Ok(delivery) => info!("sent {:?}: {:?}", line, delivery),
            Err(e) => warn!("sending {:?} failed: {}", line, e),
        }
    }

    cancel.cancelled().await;
    client.close().await?;
    Ok(vec![status])
}
