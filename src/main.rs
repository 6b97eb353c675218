use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use msgrelay::config::{RelayConfig, CHAT_SERVER_PORT};
use msgrelay::error::RelayError;
use msgrelay::logging::{init_logging, is_quiet, log_level};
use msgrelay::messaging::message::{Message, MessageId};
use msgrelay::messaging::peer_id::PeerId;
use msgrelay::relay::client::ClientEndpoint;
use msgrelay::relay::handler::SessionHandler;
use msgrelay::relay::lifecycle::{LifecycleController, Shutdown};
use msgrelay::relay::registry::ConnectionRegistry;
use msgrelay::relay::server::RelayServer;


#[derive(Parser)]
#[clap(name = "msgrelay", about = "relays framed messages between TCP clients")]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// log everything, including individual frames
    #[clap(long, global = true, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// run a relay server and a scripted client in one process, for a fixed duration
    Demo {
        #[clap(long, default_value_t = 10)]
        duration: u64,
    },
    /// run a chat relay server until Ctrl-C
    Server {
        #[clap(long, default_value = "127.0.0.1")]
        host: IpAddr,
        #[clap(long, default_value_t = CHAT_SERVER_PORT)]
        port: u16,
    },
    /// connect to a chat relay server, sending lines read from stdin
    Client {
        #[clap(long)]
        name: String,
        #[clap(long, default_value = "127.0.0.1")]
        host: IpAddr,
        #[clap(long, default_value_t = CHAT_SERVER_PORT)]
        port: u16,
    },
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(log_level(is_quiet(), args.very_verbose));

    match args.command {
        Command::Demo { duration } => run_demo(Duration::from_secs(duration)).await,
        Command::Server { host, port } => run_server(SocketAddr::new(host, port)).await,
        Command::Client { name, host, port } => run_client(name, SocketAddr::new(host, port)).await,
    }
}

/// cancels the token on Ctrl-C
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C");
            cancel.cancel();
        }
    });
}

async fn run_demo(duration: Duration) -> anyhow::Result<()> {
    let config = RelayConfig {
        demo_duration: duration,
        ..RelayConfig::demo()
    };
    let shutdown = Shutdown::After(config.demo_duration);
    let controller = LifecycleController::new(config)?;
    cancel_on_ctrl_c(controller.cancel_token());

    let report = controller.run(shutdown).await?;
    for session in &report.sessions {
        info!("{:?} session {:?} -> {:?}: {:?}", session.role, session.local_addr, session.remote_addr, session.state);
    }
    for failure in &report.close_failures {
        warn!("closing {:?} to {:?} failed: {}", failure.connection, failure.remote_addr, failure.error);
    }
    if report.remaining_connections > 0 {
        bail!("{} connections were left open", report.remaining_connections);
    }
    Ok(())
}

async fn run_server(addr: SocketAddr) -> anyhow::Result<()> {
    let config = RelayConfig::new(addr);
    config.validate()?;

    let registry = Arc::new(ConnectionRegistry::new());
    let server = RelayServer::new(Arc::new(config), registry.clone());
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    server.listen(addr, cancel).await?;

    for failure in registry.close_all().await {
        warn!("closing {:?} to {:?} failed: {}", failure.connection, failure.remote_addr, failure.error);
    }
    Ok(())
}


/// prints everything it receives to stdout
struct ConsoleHandler;

#[async_trait]
impl SessionHandler for ConsoleHandler {
    async fn on_message(&self, _from: &PeerId, message: &Message) -> Result<(), RelayError> {
        match message.payload_str() {
            Some(text) => println!("[{}] {}", message.sender(), text),
            None => println!("[{}] <{} bytes of binary data>", message.sender(), message.payload().len()),
        }
        Ok(())
    }

    async fn on_unreachable(&self, _id: MessageId, target: Option<PeerId>) {
        match target {
            Some(target) => println!("*** '{}' is not connected", target),
            None => println!("*** message could not be delivered"),
        }
    }

    async fn on_disconnect(&self, peer: &PeerId) {
        println!("*** disconnected from {}", peer);
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Input {
    Quit,
    Broadcast(String),
    Direct(PeerId, String),
    Empty,
}

fn parse_input(line: &str) -> anyhow::Result<Input> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    if line.eq_ignore_ascii_case("quit") {
        return Ok(Input::Quit);
    }
    if let Some(rest) = line.strip_prefix("/to ") {
        let (target, text) = rest.trim_start().split_once(' ')
            .ok_or_else(|| anyhow!("usage: /to <peer> <text>"))?;
        return Ok(Input::Direct(PeerId::new(target)?, text.trim().to_string()));
    }
    Ok(Input::Broadcast(line.to_string()))
}

async fn run_client(name: String, server_addr: SocketAddr) -> anyhow::Result<()> {
    let name = PeerId::new(name)?;
    let config = RelayConfig::new(server_addr);
    config.validate()?;

    let registry = Arc::new(ConnectionRegistry::new());
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let client = ClientEndpoint::connect(&config, name, Arc::new(ConsoleHandler), registry.clone(), &cancel).await?;
    println!("connected to {} as '{}' - type 'quit' to leave, '/to <peer> <text>' for direct messages", server_addr, client.name());

    let mut status = client.status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = select! {
            line = lines.next_line() => line?,
            _ = status.wait_until_closed() => break,
            _ = cancel.cancelled() => break,
        };
        let Some(line) = line else {
            break;
        };

        let (payload, target) = match parse_input(&line) {
            Ok(Input::Quit) => break,
            Ok(Input::Empty) => continue,
            Ok(Input::Broadcast(text)) => (text, None),
            Ok(Input::Direct(target, text)) => (text, Some(target)),
            Err(e) => {
                println!("*** {}", e);
                continue;
            }
        };
        match client.send(payload, target).await {
            Ok(_) => {}
            Err(RelayError::PeerUnreachable(_)) => {} // reported through the handler
            Err(e) => println!("*** sending failed: {}", e),
        }
    }

    client.close().await?;
    registry.close_all().await;
    Ok(())
}
