//! Cluster identity, protocol timing, and write limits.

use std::collections::BTreeSet;
use std::ops::Range;
use std::time::Duration;

use anyhow::{Result, ensure};

use crate::types::{NodeId, quorum};

/// Identity of this replica and the peers it replicates with.
///
/// Supplied once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    id: NodeId,
    peers: Vec<NodeId>,
}

impl ClusterConfig {
    /// Validates the identity: non-empty ids, no duplicates, and self not listed as a peer.
    pub fn new(id: impl Into<NodeId>, peers: Vec<NodeId>) -> Result<Self> {
        let id = id.into();
        ensure!(!id.is_empty(), "replica id must not be empty");
        ensure!(
            !peers.iter().any(|peer| peer.is_empty()),
            "peer ids must not be empty"
        );
        ensure!(
            !peers.contains(&id),
            "replica {id} must not appear in its own peer list"
        );
        let unique: BTreeSet<&NodeId> = peers.iter().collect();
        ensure!(unique.len() == peers.len(), "peer list contains duplicates");
        Ok(Self { id, peers })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn is_peer(&self, id: &str) -> bool {
        self.peers.iter().any(|peer| peer == id)
    }

    /// Number of replicas including this one.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum(&self) -> usize {
        quorum(self.cluster_size())
    }
}

/// Ceiling on the JSON encoding of a single log entry.
///
/// An entry travels inside one announcement datagram, and UDP carries at most
/// 65,507 bytes. The remainder is room for the announcement envelope.
pub const MAX_ENTRY_BYTES: usize = 60 * 1024;

/// Protocol timing. Defaults follow the cadences the protocol was tuned with.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Leader silence tolerated before the first election a replica takes part in.
    pub initial_leader_timeout: Duration,
    /// Leader silence tolerated once the replica has campaigned, voted, or followed a leader.
    pub leader_timeout: Duration,
    /// Window an election attempt is randomly bounded by.
    pub election_timeout: Range<Duration>,
    /// Cadence at which a candidate re-broadcasts its vote request.
    pub vote_request_interval: Duration,
    /// Cadence at which a voter re-sends its vote.
    pub vote_resend_interval: Duration,
    /// Cadence of leader heartbeats.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single transport poll.
    pub poll_interval: Duration,
    /// Largest encoded entry a leader accepts. Bigger writes are answered with `fail`.
    pub max_entry_bytes: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            initial_leader_timeout: Duration::from_millis(300),
            leader_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_millis(300)..Duration::from_millis(700),
            vote_request_interval: Duration::from_millis(150),
            vote_resend_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            max_entry_bytes: MAX_ENTRY_BYTES,
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.election_timeout.start <= self.election_timeout.end,
            "election timeout range is inverted"
        );
        ensure!(
            self.heartbeat_interval < self.leader_timeout,
            "heartbeat interval must be shorter than the leader timeout"
        );
        ensure!(
            !self.poll_interval.is_zero(),
            "poll interval must be positive"
        );
        ensure!(
            (1..=MAX_ENTRY_BYTES).contains(&self.max_entry_bytes),
            "max entry size must be between 1 and {MAX_ENTRY_BYTES} bytes"
        );
        Ok(())
    }
}
