//! Worker thread that drives one replica.
//!
//! The [`Node`] itself performs no I/O. The worker owns the node together with
//! a [`Transport`] and runs a single loop:
//!
//! 1. Wait for an inbound message, but never past the node's next timer
//!    deadline (or the poll interval, whichever comes first)
//! 2. Hand the message to the node and send whatever it produces
//! 3. Tick the node's timers and send whatever that produces
//! 4. Log role and leader changes
//!
//! Keeping the node on one thread means protocol state needs no locks. The
//! caller talks to the worker through a [`NodeHandle`], which forwards
//! requests over a crossbeam channel.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use tracing::{error, info};

use crate::node::{Node, NodeStatus, Outbox};
use crate::transport::Transport;
use crate::types::{NodeId, Role};

/// How long [`NodeHandle::status`] waits for the worker to answer.
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle for a replica running on its own worker thread.
///
/// Dropping the handle asks the worker to stop without waiting for it.
pub struct NodeHandle {
    id: NodeId,
    control_tx: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Snapshot of the replica's role, term, leader and store.
    pub fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = bounded(1);
        self.control_tx
            .send(Control::Status {
                respond_to: resp_tx,
            })
            .context("failed to send status request")?;
        resp_rx
            .recv_timeout(STATUS_TIMEOUT)
            .context("status response not received")
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.control_tx.send(Control::Shutdown);
        self.join()
    }

    /// Blocks until the worker exits on its own, which only happens if it fails.
    pub fn wait(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow!("worker thread for {} panicked", self.id)),
            None => Ok(()),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

/// Requests from a [`NodeHandle`] to its worker.
enum Control {
    Status { respond_to: Sender<NodeStatus> },
    Shutdown,
}

/// Moves `node` and `transport` onto a new worker thread and starts the loop.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned. Failures inside the
/// loop (a broken transport) are logged and end the worker.
pub fn spawn_node<T>(node: Node, transport: T) -> Result<NodeHandle>
where
    T: Transport + Send + 'static,
{
    let id = node.id().clone();
    let (control_tx, control_rx) = unbounded();

    let thread = thread::Builder::new()
        .name(format!("kv-replica-{id}"))
        .spawn(move || {
            let mut worker = Worker::new(node, transport, control_rx);
            if let Err(err) = worker.run() {
                error!(node = %worker.node.id(), "replica worker crashed: {err:?}");
            }
        })
        .with_context(|| format!("failed to spawn worker for {id}"))?;

    Ok(NodeHandle {
        id,
        control_tx,
        thread: Some(thread),
    })
}

struct Worker<T> {
    node: Node,
    transport: T,
    control_rx: Receiver<Control>,
    last_role: Role,
    last_leader: Option<NodeId>,
}

impl<T: Transport> Worker<T> {
    fn new(node: Node, transport: T, control_rx: Receiver<Control>) -> Self {
        let last_role = node.role();
        let last_leader = node.leader().cloned();
        Self {
            node,
            transport,
            control_rx,
            last_role,
            last_leader,
        }
    }

    fn run(&mut self) -> Result<()> {
        info!(
            node = %self.node.id(),
            peers = ?self.node.config().peers(),
            "replica started"
        );
        loop {
            if !self.drain_control() {
                break;
            }

            let now = Instant::now();
            let wait = self
                .node
                .next_deadline()
                .saturating_duration_since(now)
                .min(self.node.timing().poll_interval);

            if let Some(msg) = self.transport.recv_timeout(wait)? {
                let out = self.node.handle(msg, Instant::now());
                self.flush(out)?;
            }

            let out = self.node.tick(Instant::now());
            self.flush(out)?;
            self.log_transitions();
        }

        info!(node = %self.node.id(), "replica stopped");
        Ok(())
    }

    /// Answers pending control requests. Returns `false` once the worker
    /// should stop.
    fn drain_control(&mut self) -> bool {
        loop {
            match self.control_rx.try_recv() {
                Ok(Control::Status { respond_to }) => {
                    let _ = respond_to.send(self.node.status());
                }
                Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn flush(&mut self, out: Outbox) -> Result<()> {
        for msg in out {
            self.transport.send(msg)?;
        }
        Ok(())
    }

    fn log_transitions(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            info!(
                node = %self.node.id(),
                from = %self.last_role,
                to = %role,
                term = self.node.term(),
                "role changed"
            );
            self.last_role = role;
        }

        let leader = self.node.leader();
        if leader != self.last_leader.as_ref() {
            match leader {
                Some(leader) => info!(
                    node = %self.node.id(),
                    %leader,
                    term = self.node.term(),
                    "leader changed"
                ),
                None => info!(node = %self.node.id(), term = self.node.term(), "leader lost"),
            }
            self.last_leader = leader.cloned();
        }
    }
}
