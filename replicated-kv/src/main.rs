//! Command-line entry point.
//!
//! Start a 3-replica cluster on one machine:
//! ```bash
//! # Terminal 1
//! replicated-kv node --id A --listen 127.0.0.1:7101 \
//!   --peer B=127.0.0.1:7102,C=127.0.0.1:7103
//!
//! # Terminal 2
//! replicated-kv node --id B --listen 127.0.0.1:7102 \
//!   --peer A=127.0.0.1:7101,C=127.0.0.1:7103
//!
//! # Terminal 3
//! replicated-kv node --id C --listen 127.0.0.1:7103 \
//!   --peer A=127.0.0.1:7101,B=127.0.0.1:7102
//!
//! # Then, from anywhere
//! replicated-kv client --peer A=127.0.0.1:7101,B=127.0.0.1:7102,C=127.0.0.1:7103 put x 1
//! replicated-kv client --peer A=127.0.0.1:7101,B=127.0.0.1:7102,C=127.0.0.1:7103 get x
//! ```

use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use nanoid::nanoid;
use tracing::info;

use replicated_kv::cli::{Cli, ClientArgs, ClientOp, Command, NodeArgs, parse_peers};
use replicated_kv::client::Client;
use replicated_kv::config::ClusterConfig;
use replicated_kv::node::Node;
use replicated_kv::runtime::spawn_node;
use replicated_kv::transport::UdpTransport;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => run_node(args),
        Command::Client(args) => run_client(args),
    }
}

fn run_node(args: NodeArgs) -> Result<()> {
    let peers = args.peers()?;
    let timing = args.timing.to_timing()?;
    let mut peer_ids: Vec<_> = peers.keys().cloned().collect();
    peer_ids.sort();
    let config = ClusterConfig::new(args.id.clone(), peer_ids)?;

    let transport = UdpTransport::bind(args.id.clone(), args.listen, peers)?;
    info!(node = %args.id, listen = %transport.local_addr()?, "listening");

    let now = Instant::now();
    let node = match args.seed {
        Some(seed) => Node::with_seed(config, timing, seed, now),
        None => Node::new(config, timing, now),
    };
    spawn_node(node, transport)?.wait()
}

fn run_client(args: ClientArgs) -> Result<()> {
    let peers = parse_peers(&args.peer)?;
    let mut replicas: Vec<_> = peers.keys().cloned().collect();
    replicas.sort();

    let id = args.id.unwrap_or_else(|| format!("client-{}", nanoid!(8)));
    let transport = UdpTransport::bind(id.clone(), args.bind, peers)?;
    let mut client = Client::new(id, transport, replicas)?
        .with_reply_timeout(Duration::from_millis(args.timeout_ms))
        .with_max_attempts(args.attempts);

    match args.op {
        ClientOp::Get { key } => println!("{}", client.get(&key)?),
        ClientOp::Put { key, value } => {
            client.put(&key, &value)?;
            println!("OK");
        }
    }
    Ok(())
}
