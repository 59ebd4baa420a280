//! Messages exchanged between replicas and clients.
//!
//! The consensus core deals in structured [`Message`] values only. The JSON
//! helpers at the bottom exist for transports that need bytes; the core never
//! calls them.

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::types::{LogIndex, NodeId, Term};

/// Wire spelling of the broadcast address.
pub const BROADCAST: &str = "FFFF";

/// Where a message should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    /// Every peer replica.
    Broadcast,
    /// One replica or client.
    Node(NodeId),
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Destination::Broadcast
        } else {
            Destination::Node(value)
        }
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        match value {
            Destination::Broadcast => BROADCAST.to_string(),
            Destination::Node(id) => id,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str(BROADCAST),
            Destination::Node(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub src: NodeId,
    pub dst: Destination,
    #[serde(flatten)]
    pub body: Body,
}

impl Message {
    pub fn to(src: impl Into<NodeId>, dst: impl Into<NodeId>, body: Body) -> Self {
        Self {
            src: src.into(),
            dst: Destination::Node(dst.into()),
            body,
        }
    }

    pub fn broadcast(src: impl Into<NodeId>, body: Body) -> Self {
        Self {
            src: src.into(),
            dst: Destination::Broadcast,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Client read.
    Get { mid: String, key: String },
    /// Client write.
    Put {
        mid: String,
        key: String,
        value: String,
    },
    /// Not the leader; retry at `leader`.
    Redirect { mid: String, leader: NodeId },
    /// Success. Reads always carry a value (empty for a missing key).
    Ok {
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Rejected, typically because no leader is known.
    Fail { mid: String },
    /// Leadership claim, heartbeat, and replication of the entry at `index`.
    Announce {
        term: Term,
        leader: NodeId,
        index: LogIndex,
        #[serde(default)]
        entry: Option<LogEntry>,
    },
    /// Campaign for `term`.
    VoteRequest {
        term: Term,
        candidate: NodeId,
        last_index: LogIndex,
    },
    /// Vote granted for `term`.
    Vote { term: Term },
    /// Ask the leader for the entry at `index`.
    CatchUp { index: LogIndex },
}

impl Body {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Get { .. } => "get",
            Body::Put { .. } => "put",
            Body::Redirect { .. } => "redirect",
            Body::Ok { .. } => "ok",
            Body::Fail { .. } => "fail",
            Body::Announce { .. } => "announce",
            Body::VoteRequest { .. } => "vote_request",
            Body::Vote { .. } => "vote",
            Body::CatchUp { .. } => "catch_up",
        }
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).context("failed to encode message")
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    serde_json::from_slice(bytes).context("failed to decode message")
}
