//! Per-replica protocol state and message dispatch.
//!
//! A [`Node`] owns one replica's entire `ReplicaState`: role, term, known
//! leader, log and key-value store. It is the single entry point for inbound
//! messages (from peers and clients) and for timer ticks. The node performs no
//! I/O: every operation takes the current instant and returns the messages it
//! wants sent, leaving delivery to the event loop in [`crate::runtime`].
//!
//! Election logic lives in [`crate::election`] and log replication in
//! [`crate::replication`]; both are further `impl Node` blocks operating on
//! the same state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, trace, warn};

use crate::config::{ClusterConfig, Timing};
use crate::election::{Ballot, Campaign};
use crate::log::{LogEntry, ReplicatedLog};
use crate::message::{Body, Destination, Message};
use crate::store::KvStore;
use crate::timer::Timer;
use crate::types::{LogIndex, NO_INDEX, NodeId, Role, Term};

/// Messages produced by a single call into the node.
pub type Outbox = Vec<Message>;

/// What a replica is doing right now, with the timers that belong to it.
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    /// Following a leader, or waiting for one. `ballot` is set while a vote
    /// granted to some candidate is still outstanding.
    Follower { ballot: Option<Ballot> },
    Candidate(Campaign),
    Leader { heartbeat: Timer },
}

/// Everything one replica knows. Created once at startup and only mutated by
/// its owning [`Node`].
#[derive(Debug, Clone)]
pub(crate) struct ReplicaState {
    pub(crate) phase: Phase,
    pub(crate) term: Term,
    pub(crate) leader: Option<NodeId>,
    /// Highest-term vote this replica has cast, self-votes included.
    pub(crate) voted_for: Option<(Term, NodeId)>,
    pub(crate) log: ReplicatedLog,
    pub(crate) store: KvStore,
    /// Expires when the leader has been silent for too long.
    pub(crate) heartbeat_deadline: Timer,
    /// Newest index the current leader has advertised.
    pub(crate) leader_index: LogIndex,
    /// Set once this replica has campaigned, voted, or followed a leader.
    pub(crate) seen_election: bool,
}

impl ReplicaState {
    fn new(now: Instant, initial_timeout: Duration) -> Self {
        Self {
            phase: Phase::Follower { ballot: None },
            term: 0,
            leader: None,
            voted_for: None,
            log: ReplicatedLog::new(),
            store: KvStore::new(),
            heartbeat_deadline: Timer::new(now, initial_timeout),
            leader_index: NO_INDEX,
            seen_election: false,
        }
    }

    pub(crate) fn role(&self) -> Role {
        match self.phase {
            Phase::Follower { .. } => Role::Follower,
            Phase::Candidate(_) => Role::Candidate,
            Phase::Leader { .. } => Role::Leader,
        }
    }

    /// Appends one entry at the next position and applies it to the store.
    ///
    /// This is the only path that grows the log or mutates the store.
    pub(crate) fn add_to_log(&mut self, entry: LogEntry) -> LogIndex {
        self.store.apply(&entry);
        self.log.append(entry)
    }
}

/// Point-in-time view of a replica, for status displays and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub last_index: LogIndex,
    pub store: BTreeMap<String, String>,
}

/// One replica of the key-value store.
pub struct Node {
    pub(crate) config: ClusterConfig,
    pub(crate) timing: Timing,
    pub(crate) rng: StdRng,
    pub(crate) state: ReplicaState,
}

impl Node {
    /// Creates a follower at term 0 with an empty log.
    pub fn new(config: ClusterConfig, timing: Timing, now: Instant) -> Self {
        Self::with_rng(config, timing, StdRng::from_entropy(), now)
    }

    /// Like [`Node::new`] with a fixed seed for election jitter.
    pub fn with_seed(config: ClusterConfig, timing: Timing, seed: u64, now: Instant) -> Self {
        Self::with_rng(config, timing, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(config: ClusterConfig, timing: Timing, rng: StdRng, now: Instant) -> Self {
        let state = ReplicaState::new(now, timing.initial_leader_timeout);
        Self {
            config,
            timing,
            rng,
            state,
        }
    }

    pub fn id(&self) -> &NodeId {
        self.config.id()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> Term {
        self.state.term
    }

    /// Currently recognized leader, `None` while unknown.
    pub fn leader(&self) -> Option<&NodeId> {
        self.state.leader.as_ref()
    }

    pub fn voted_for(&self) -> Option<&(Term, NodeId)> {
        self.state.voted_for.as_ref()
    }

    pub fn last_index(&self) -> LogIndex {
        self.state.log.last_index()
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.state.log
    }

    pub fn store(&self) -> &KvStore {
        &self.state.store
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id().clone(),
            role: self.role(),
            term: self.term(),
            leader: self.state.leader.clone(),
            last_index: self.last_index(),
            store: self.state.store.snapshot(),
        }
    }

    /// Earliest instant at which [`Node::tick`] has timer work to do.
    pub fn next_deadline(&self) -> Instant {
        match &self.state.phase {
            Phase::Leader { heartbeat } => heartbeat.deadline(),
            Phase::Candidate(campaign) => campaign.deadline.deadline().min(campaign.resend.deadline()),
            Phase::Follower { ballot } => {
                let liveness = self.state.heartbeat_deadline.deadline();
                match ballot {
                    Some(ballot) => liveness.min(ballot.resend.deadline()),
                    None => liveness,
                }
            }
        }
    }

    /// Runs timer-driven transitions: leader heartbeats, vote and vote-request
    /// resends, election timeouts, and starting a new election.
    pub fn tick(&mut self, now: Instant) -> Outbox {
        let mut out = Outbox::new();
        match self.role() {
            Role::Leader => self.heartbeat_tick(now, &mut out),
            Role::Candidate => self.campaign_tick(now, &mut out),
            Role::Follower => {
                self.ballot_tick(now, &mut out);
                if self.election_due(now) {
                    self.begin_election(now, &mut out);
                }
            }
        }
        out
    }

    /// Dispatches one inbound message.
    pub fn handle(&mut self, msg: Message, now: Instant) -> Outbox {
        let mut out = Outbox::new();
        let Message { src, dst, body } = msg;

        if src == *self.id() {
            // Broadcast loopback.
            trace!(node = %self.id(), kind = body.kind(), "dropping message from self");
            return out;
        }
        if let Destination::Node(dst) = &dst {
            if dst != self.id() {
                debug!(node = %self.id(), %dst, kind = body.kind(), "dropping misaddressed message");
                return out;
            }
        }

        match body {
            Body::Get { mid, key } => self.on_client_get(src, mid, &key, &mut out),
            Body::Put { mid, key, value } => self.on_client_put(src, mid, key, value, &mut out),
            Body::Announce {
                term,
                leader,
                index,
                entry,
            } if self.config.is_peer(&src) => {
                self.on_announce(src, term, leader, index, entry, now, &mut out)
            }
            Body::VoteRequest {
                term,
                candidate,
                last_index,
            } if self.config.is_peer(&src) => {
                self.on_vote_request(src, term, candidate, last_index, now, &mut out)
            }
            Body::Vote { term } if self.config.is_peer(&src) => {
                self.on_vote(src, term, now, &mut out)
            }
            Body::CatchUp { index } if self.config.is_peer(&src) => {
                self.on_catch_up(src, index, &mut out)
            }
            reply @ (Body::Redirect { .. } | Body::Ok { .. } | Body::Fail { .. }) => {
                debug!(node = %self.id(), %src, kind = reply.kind(), "ignoring client-bound reply");
            }
            other => {
                debug!(node = %self.id(), %src, kind = other.kind(), "ignoring protocol message from unknown replica");
            }
        }
        out
    }

    fn on_client_get(&mut self, src: NodeId, mid: String, key: &str, out: &mut Outbox) {
        if !self.is_leader() {
            self.reject_client(src, mid, out);
            return;
        }
        let value = self.state.store.get(key).unwrap_or_default().to_string();
        out.push(Message::to(
            self.id().clone(),
            src,
            Body::Ok {
                mid,
                value: Some(value),
            },
        ));
    }

    fn on_client_put(&mut self, src: NodeId, mid: String, key: String, value: String, out: &mut Outbox) {
        if !self.is_leader() {
            self.reject_client(src, mid, out);
            return;
        }
        let entry = LogEntry { key, value };
        let size = entry.encoded_len();
        if size > self.timing.max_entry_bytes {
            warn!(
                node = %self.id(),
                client = %src,
                size,
                limit = self.timing.max_entry_bytes,
                "refusing oversized write"
            );
            out.push(Message::to(self.id().clone(), src, Body::Fail { mid }));
            return;
        }
        self.accept_write(entry, out);
        out.push(Message::to(
            self.id().clone(),
            src,
            Body::Ok { mid, value: None },
        ));
    }

    /// Redirects to the known leader, or fails when none is known.
    fn reject_client(&self, src: NodeId, mid: String, out: &mut Outbox) {
        let body = match &self.state.leader {
            Some(leader) => Body::Redirect {
                mid,
                leader: leader.clone(),
            },
            None => Body::Fail { mid },
        };
        out.push(Message::to(self.id().clone(), src, body));
    }

    /// Current liveness timeout: short until the replica first takes part in an election.
    pub(crate) fn liveness_timeout(&self) -> Duration {
        if self.state.seen_election {
            self.timing.leader_timeout
        } else {
            self.timing.initial_leader_timeout
        }
    }

    pub(crate) fn rearm_liveness(&mut self, now: Instant) {
        let timeout = self.liveness_timeout();
        self.state.heartbeat_deadline.rearm_with(now, timeout);
    }
}
