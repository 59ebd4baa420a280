use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Args, Parser, Subcommand, ValueHint};

use crate::config::{MAX_ENTRY_BYTES, Timing};
use crate::types::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated key-value store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one replica until the process is killed.
    Node(NodeArgs),
    /// Send a single get or put to the cluster.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Replica id, unique within the cluster.
    #[arg(long)]
    pub id: NodeId,

    /// UDP address this replica listens on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub listen: SocketAddr,

    /// Peer replicas as id=addr. Repeat the flag or separate with commas.
    /// An entry for this replica's own id is ignored.
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Seed for election jitter. Random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    #[command(flatten)]
    pub timing: TimingArgs,
}

impl NodeArgs {
    /// Peer map with this replica's own entry removed.
    pub fn peers(&self) -> Result<HashMap<NodeId, SocketAddr>> {
        let mut peers = parse_peers(&self.peer)?;
        peers.remove(&self.id);
        Ok(peers)
    }
}

/// Protocol overrides. Durations are in milliseconds.
#[derive(Args, Debug, Clone)]
pub struct TimingArgs {
    /// Leader timeout before this replica has seen any election.
    #[arg(long, default_value_t = 300)]
    pub initial_leader_timeout_ms: u64,

    /// Leader timeout once an election has happened.
    #[arg(long, default_value_t = 2000)]
    pub leader_timeout_ms: u64,

    /// Lower bound of the randomized election timeout.
    #[arg(long, default_value_t = 300)]
    pub election_timeout_min_ms: u64,

    /// Upper bound (exclusive) of the randomized election timeout.
    #[arg(long, default_value_t = 700)]
    pub election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 150)]
    pub vote_request_interval_ms: u64,

    #[arg(long, default_value_t = 250)]
    pub vote_resend_interval_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Largest write accepted, measured as the JSON-encoded key and value.
    #[arg(long, default_value_t = MAX_ENTRY_BYTES)]
    pub max_entry_bytes: usize,
}

impl TimingArgs {
    pub fn to_timing(&self) -> Result<Timing> {
        let timing = Timing {
            initial_leader_timeout: Duration::from_millis(self.initial_leader_timeout_ms),
            leader_timeout: Duration::from_millis(self.leader_timeout_ms),
            election_timeout: Duration::from_millis(self.election_timeout_min_ms)
                ..Duration::from_millis(self.election_timeout_max_ms),
            vote_request_interval: Duration::from_millis(self.vote_request_interval_ms),
            vote_resend_interval: Duration::from_millis(self.vote_resend_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_entry_bytes: self.max_entry_bytes,
        };
        timing.validate()?;
        Ok(timing)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Replicas as id=addr. Repeat the flag or separate with commas.
    #[arg(long, value_delimiter = ',', required = true, value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Client id used as the message source. Random when omitted.
    #[arg(long)]
    pub id: Option<NodeId>,

    /// Local UDP address to send from.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub bind: SocketAddr,

    /// How long to wait for each reply.
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Attempts before giving up, counting redirects.
    #[arg(long, default_value_t = 10)]
    pub attempts: usize,

    #[command(subcommand)]
    pub op: ClientOp,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientOp {
    /// Read a key. Missing keys print as an empty line.
    Get { key: String },
    /// Write a key.
    Put { key: String, value: String },
}

/// Parses `id=addr` entries into a peer map.
pub fn parse_peers(entries: &[String]) -> Result<HashMap<NodeId, SocketAddr>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id = id.trim();
        ensure!(!id.is_empty(), "empty peer id in '{entry}'");
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        ensure!(
            peers.insert(id.to_string(), addr).is_none(),
            "peer '{id}' listed more than once"
        );
    }
    Ok(peers)
}
