//! Length-prefixed echo server built on the framework.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use clap::Parser;
use kiln_server::{Config, Connection, Decode, Message, Packet, Server, Service, logging};
use protocol_echo::{Frame, ParseError};
use tracing::info;

#[derive(Parser)]
#[command(name = "kiln-echo")]
#[command(about = "Length-prefixed echo server")]
struct Args {
    /// Path to a TOML configuration file
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1:7777")]
    listen: SocketAddr,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Echoes every frame back to its sender.
struct EchoService;

impl Service for EchoService {
    fn decode(&self, buf: &mut BytesMut) -> Decode {
        match Frame::parse(buf) {
            Ok((frame, consumed)) => {
                buf.advance(consumed);
                Decode::Frame(Box::new(frame))
            }
            Err(ParseError::Incomplete) => Decode::Incomplete,
            Err(ParseError::Oversize(_)) => Decode::Invalid,
        }
    }

    fn encode(&self, response: &Packet, out: &mut BytesMut) {
        if let Some(frame) = response.downcast_ref::<Frame>() {
            frame.encode(out);
        }
    }

    fn process(&self, message: &mut Message) {
        if let Some(request) = message.take_request() {
            message.set_response(request);
        }
    }

    fn on_connect(&self, conn: &Arc<Connection>) {
        info!(peer = %conn.peer_addr(), "client connected");
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        info!(peer = %conn.peer_addr(), "client disconnected");
    }
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config, args.listen) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config, listen: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(config)?;
    let addr = server.add_listener(listen, Arc::new(EchoService))?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.shutdown();
    })?;

    server.start()?;
    info!(addr = %addr, "echo server running, Ctrl-C to stop");
    server.run()?;

    Ok(())
}

fn print_default_config() {
    let config = r#"# Kiln echo server configuration

# Number of reactor threads (>= 1). Reactor 0 accepts and steers.
io_threads = 1

# Worker pool size; 0 runs request processing on the reactors.
worker_threads = 0

# Apply TCP_NODELAY to accepted sockets.
tcp_nodelay = false

# CPU cores to pin threads to, Linux-style (e.g. "0-3,6-8").
# cpu_affinity = "0-3"

[logging]
# Log level when RUST_LOG is not set.
level = "info"

# Output format: "pretty", "compact", or "json".
format = "pretty"

# Include thread names in output.
thread_names = true
"#;
    print!("{}", config);
}
