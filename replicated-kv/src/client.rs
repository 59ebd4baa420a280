//! Client for talking to a replica cluster.
//!
//! Requests go to whichever replica the client believes is leading. A
//! `redirect` reply moves the client to the named leader; a `fail` reply or
//! silence moves it to the next replica in its list. Each attempt uses a
//! fresh message id so late replies to earlier attempts are ignored.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail, ensure};
use nanoid::nanoid;
use tracing::debug;

use crate::message::{Body, Message};
use crate::transport::Transport;
use crate::types::NodeId;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: usize = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What a replica said about one attempt.
enum Outcome {
    Done(Option<String>),
    Redirect(NodeId),
    Retry,
}

pub struct Client<T> {
    id: NodeId,
    transport: T,
    replicas: Vec<NodeId>,
    target: NodeId,
    reply_timeout: Duration,
    max_attempts: usize,
    retry_delay: Duration,
}

impl<T: Transport> Client<T> {
    pub fn new(id: impl Into<NodeId>, transport: T, replicas: Vec<NodeId>) -> Result<Self> {
        ensure!(!replicas.is_empty(), "client needs at least one replica");
        let target = replicas[0].clone();
        Ok(Self {
            id: id.into(),
            transport,
            replicas,
            target,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// How long to wait for each reply before moving on.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Pause after a `fail` reply, giving the cluster time to elect a leader.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Replica the next request will be sent to.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Reads `key` from the leader. A missing key reads as the empty string.
    pub fn get(&mut self, key: &str) -> Result<String> {
        let value = self.request(|mid| Body::Get {
            mid,
            key: key.to_string(),
        })?;
        Ok(value.unwrap_or_default())
    }

    /// Writes `key` through the leader.
    pub fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.request(|mid| Body::Put {
            mid,
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    fn request(&mut self, build: impl Fn(String) -> Body) -> Result<Option<String>> {
        for attempt in 1..=self.max_attempts {
            let mid = nanoid!();
            let target = self.target.clone();
            let body = build(mid.clone());
            debug!(client = %self.id, %target, %mid, attempt, kind = body.kind(), "sending request");
            self.transport.send(Message::to(self.id.clone(), target, body))?;

            match self.await_reply(&mid)? {
                Outcome::Done(value) => return Ok(value),
                Outcome::Redirect(leader) => {
                    debug!(client = %self.id, %leader, "redirected");
                    self.target = leader;
                }
                Outcome::Retry => {
                    self.rotate_target();
                    thread::sleep(self.retry_delay);
                }
            }
        }
        bail!(
            "no leader answered after {} attempts (last tried {})",
            self.max_attempts,
            self.target
        )
    }

    fn await_reply(&mut self, mid: &str) -> Result<Outcome> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(client = %self.id, target = %self.target, %mid, "request timed out");
                return Ok(Outcome::Retry);
            }
            let Some(msg) = self.transport.recv_timeout(remaining)? else {
                continue;
            };
            match msg.body {
                Body::Ok { mid: reply, value } if reply == mid => return Ok(Outcome::Done(value)),
                Body::Redirect { mid: reply, leader } if reply == mid => {
                    return Ok(Outcome::Redirect(leader));
                }
                Body::Fail { mid: reply } if reply == mid => {
                    debug!(client = %self.id, src = %msg.src, %mid, "request failed");
                    return Ok(Outcome::Retry);
                }
                other => {
                    debug!(client = %self.id, src = %msg.src, kind = other.kind(), "ignoring unrelated message");
                }
            }
        }
    }

    fn rotate_target(&mut self) {
        let next = self
            .replicas
            .iter()
            .position(|id| *id == self.target)
            .map_or(0, |pos| (pos + 1) % self.replicas.len());
        self.target = self.replicas[next].clone();
    }
}
