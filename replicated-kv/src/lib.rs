//! Leader-based replicated key-value store.
//!
//! A small, fixed cluster of replicas elects a single leader per term. The
//! leader accepts client writes, appends them to its log, applies them to its
//! key-value store, and announces each entry to the other replicas. Followers
//! apply announced entries in order and ask the leader for any entries they
//! missed. Reads are served by the leader; other replicas redirect clients to
//! it. Messages may be lost, delayed, or duplicated, and every exchange is
//! retried on a timer.
//!
//! # Architecture
//!
//! - **Protocol core** ([`node`], [`election`], [`replication`]): a sans-IO
//!   state machine. Every call takes the current instant and returns the
//!   messages to send, so the whole protocol is deterministic under test.
//! - **Worker thread** ([`runtime`]): owns one [`node::Node`] and a
//!   [`transport::Transport`], drives timers, and answers status requests
//!   over a crossbeam channel.
//! - **Transports** ([`transport`]): in-process channels for tests and UDP
//!   datagrams carrying JSON for real deployments.
//!
//! # Modules
//!
//! - [`types`]: node ids, terms, log indices, roles, quorum size
//! - [`config`]: cluster membership and protocol timing
//! - [`timer`]: restartable deadlines and randomized timeouts
//! - [`log`]: the append-only replicated log
//! - [`store`]: the key-value state machine
//! - [`message`]: wire messages and their JSON encoding
//! - [`client`]: request/redirect/retry client
//! - [`cli`]: command-line interface for the binary

pub mod cli;
pub mod client;
pub mod config;
pub mod election;
pub mod log;
pub mod message;
pub mod node;
pub mod replication;
pub mod runtime;
pub mod store;
pub mod timer;
pub mod transport;
pub mod types;
