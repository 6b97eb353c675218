use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::messaging::frame::DEFAULT_MAX_FRAME_LEN;
use crate::messaging::peer_id::PeerId;


pub const DEMO_SERVER_PORT: u16 = 50007;
pub const DEMO_CLIENT_PORT: u16 = 50008;
pub const CHAT_SERVER_PORT: u16 = 8888;

/// What the outbound loop of a session does after sending a DATA message
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckPolicy {
    /// The send completes as soon as the message is written; a late ack is consumed silently
    FireAndForget,
    /// The send completes when the ack arrives or the ack window elapses. There is no resend.
    WaitForAck,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub server_addr: SocketAddr,
    /// Local address that client endpoints bind to before connecting. `None` leaves it to the OS.
    pub client_bind_addr: Option<SocketAddr>,

    /// Upper bound for a frame's body. Frames exceeding it are a protocol violation, and a peer
    ///  sending them is disconnected.
    pub max_frame_len: usize,

    pub ack_window: Duration,
    /// applies to messages that client endpoints send
    pub client_ack_policy: AckPolicy,
    /// applies to messages that the relay server forwards to its clients
    pub server_ack_policy: AckPolicy,

    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,

    /// Number of messages that can be queued for sending per session. Client endpoints wait for
    ///  space; the relay server disconnects a peer whose queue is full.
    pub outbound_queue_capacity: usize,

    /// sent by the relay server to every peer directly after the handshake
    pub welcome_message: Option<String>,
    /// sent by the relay server to every peer after the welcome message, with a pause before each line
    pub server_script: Vec<String>,
    pub server_script_pause: Duration,

    /// number of closed sessions whose final state the relay server keeps for inspection
    pub closed_session_history: usize,

    pub demo_duration: Duration,
    pub demo_clients: Vec<DemoClientConfig>,
}

/// A client that the lifecycle controller starts in demo mode. It sends its script with a pause
///  before each message, and then stays connected until shutdown.
#[derive(Clone, Debug)]
pub struct DemoClientConfig {
    pub name: String,
    pub bind_addr: Option<SocketAddr>,
    pub script: Vec<String>,
    pub pause: Duration,
}

impl RelayConfig {
    pub fn new(server_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            server_addr,
            client_bind_addr: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            ack_window: Duration::from_secs(5),
            client_ack_policy: AckPolicy::WaitForAck,
            server_ack_policy: AckPolicy::FireAndForget,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 256,
            welcome_message: Some("Welcome to the chat! Type 'quit' to leave.".to_string()),
            server_script: Vec::new(),
            server_script_pause: Duration::from_secs(2),
            closed_session_history: 64,
            demo_duration: Duration::from_secs(10),
            demo_clients: Vec::new(),
        }
    }

    /// The socket demo: a server on port 50007 and one client bound to port 50008 exchanging a
    ///  few greetings for ten seconds
    pub fn demo() -> RelayConfig {
        let localhost = Ipv4Addr::LOCALHOST;
        RelayConfig {
            welcome_message: Some("hello from server".to_string()),
            server_script: vec!["server: How are you?".to_string()],
            server_script_pause: Duration::from_secs(2),
            demo_clients: vec![DemoClientConfig {
                name: "client".to_string(),
                bind_addr: Some(SocketAddr::V4(SocketAddrV4::new(localhost, DEMO_CLIENT_PORT))),
                script: vec![
                    "hello from client".to_string(),
                    "client: I'm fine, thanks!".to_string(),
                ],
                pause: Duration::from_secs(3),
            }],
            ..RelayConfig::new(SocketAddr::V4(SocketAddrV4::new(localhost, DEMO_SERVER_PORT)))
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_len < 64 {
            bail!("max frame length must be at least 64 bytes, was {}", self.max_frame_len);
        }
        if self.max_frame_len > u32::MAX as usize {
            bail!("max frame length must fit into the u32 frame header, was {}", self.max_frame_len);
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound queue capacity must be positive");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }

        let mut names = FxHashSet::default();
        let mut bind_addrs = FxHashSet::default();
        for client in &self.demo_clients {
            let peer_id = PeerId::new(client.name.as_str())?;
            if peer_id.is_server() {
                bail!("demo client name {:?} is reserved for the relay server", client.name);
            }
            if !names.insert(peer_id) {
                bail!("duplicate demo client name {:?}", client.name);
            }
            if let Some(addr) = client.bind_addr {
                if !bind_addrs.insert(addr) {
                    bail!("more than one demo client binds to {:?}", addr);
                }
            }
        }
        Ok(())
    }
}
