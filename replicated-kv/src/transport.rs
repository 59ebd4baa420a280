//! Message delivery between replicas and clients.
//!
//! The protocol assumes nothing about delivery: messages may be lost,
//! delayed, or duplicated, and retries are the protocol's job. A transport
//! only has to send a message to one node or broadcast it to every peer, and
//! hand back inbound messages with a bounded wait.
//!
//! Two implementations are provided:
//!
//! - [`LocalNetwork`]: in-process delivery over crossbeam channels, with
//!   per-node isolation for simulating partitions in tests.
//! - [`UdpTransport`]: one UDP socket per node carrying JSON datagrams.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, trace, warn};

use crate::message::{self, Destination, Message};
use crate::types::NodeId;

/// Largest datagram the UDP transport will read.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Shortest read timeout handed to a socket; zero would mean "block forever".
const MIN_SOCKET_WAIT: Duration = Duration::from_millis(1);

/// Client addresses remembered at once. The oldest is forgotten first.
const MAX_LEARNED_CLIENTS: usize = 1024;

pub trait Transport {
    /// Sends without waiting for delivery. Undeliverable messages are dropped.
    fn send(&mut self, msg: Message) -> Result<()>;

    /// Waits at most `timeout` for the next inbound message.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>>;
}

/// In-process network connecting replicas and clients.
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    mailboxes: HashMap<NodeId, Sender<Message>>,
    replicas: BTreeSet<NodeId>,
    isolated: HashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a replica. Replicas receive broadcasts.
    pub fn join_replica(&self, id: impl Into<NodeId>) -> LocalEndpoint {
        let id = id.into();
        self.hub().replicas.insert(id.clone());
        self.attach(id)
    }

    /// Attaches a client. Clients only receive messages addressed to them.
    pub fn join_client(&self, id: impl Into<NodeId>) -> LocalEndpoint {
        self.attach(id.into())
    }

    /// Cuts a node off: nothing it sends or should receive is delivered.
    pub fn isolate(&self, id: &str) {
        self.hub().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.hub().isolated.remove(id);
    }

    fn attach(&self, id: NodeId) -> LocalEndpoint {
        let (tx, rx) = unbounded();
        self.hub().mailboxes.insert(id.clone(), tx);
        LocalEndpoint {
            id,
            network: self.clone(),
            inbox: rx,
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, msg: Message) {
        let hub = self.hub();
        if hub.isolated.contains(&msg.src) {
            trace!(src = %msg.src, kind = msg.body.kind(), "sender isolated, dropping");
            return;
        }
        match &msg.dst {
            Destination::Broadcast => {
                for id in hub.replicas.iter().filter(|id| **id != msg.src) {
                    if hub.isolated.contains(id) {
                        continue;
                    }
                    if let Some(tx) = hub.mailboxes.get(id) {
                        let _ = tx.send(msg.clone());
                    }
                }
            }
            Destination::Node(dst) => {
                if hub.isolated.contains(dst) {
                    trace!(%dst, kind = msg.body.kind(), "receiver isolated, dropping");
                    return;
                }
                match hub.mailboxes.get(dst) {
                    Some(tx) => {
                        let _ = tx.send(msg.clone());
                    }
                    None => debug!(%dst, kind = msg.body.kind(), "no such node, dropping"),
                }
            }
        }
    }
}

/// One node's attachment to a [`LocalNetwork`].
pub struct LocalEndpoint {
    id: NodeId,
    network: LocalNetwork,
    inbox: Receiver<Message>,
}

impl LocalEndpoint {
    pub fn id(&self) -> &NodeId {
        &self.id
    }
}

impl Transport for LocalEndpoint {
    fn send(&mut self, msg: Message) -> Result<()> {
        self.network.deliver(msg);
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("mailbox for {} disconnected", self.id),
        }
    }
}

/// UDP transport carrying one JSON-encoded [`Message`] per datagram.
///
/// Peer addresses are fixed at startup. Clients are not known in advance, so
/// the address a message arrived from is remembered for replies to its sender.
pub struct UdpTransport {
    id: NodeId,
    socket: UdpSocket,
    peers: HashMap<NodeId, SocketAddr>,
    learned: LearnedAddrs,
    buf: Vec<u8>,
}

/// Reply addresses of senders outside the peer map, bounded in size.
struct LearnedAddrs {
    addrs: HashMap<NodeId, SocketAddr>,
    order: VecDeque<NodeId>,
    capacity: usize,
}

impl LearnedAddrs {
    fn new(capacity: usize) -> Self {
        Self {
            addrs: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn learn(&mut self, id: &str, addr: SocketAddr) {
        if let Some(known) = self.addrs.get_mut(id) {
            *known = addr;
            return;
        }
        self.addrs.insert(id.to_string(), addr);
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                trace!(client = %oldest, "forgetting client address");
                self.addrs.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&SocketAddr> {
        self.addrs.get(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.addrs.len()
    }
}

impl UdpTransport {
    pub fn bind(
        id: impl Into<NodeId>,
        listen: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self> {
        let id = id.into();
        let socket =
            UdpSocket::bind(listen).with_context(|| format!("failed to bind {listen} for {id}"))?;
        Ok(Self {
            id,
            socket,
            peers,
            learned: LearnedAddrs::new(MAX_LEARNED_CLIENTS),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("failed to read local address")
    }

    fn address_of(&self, id: &str) -> Option<SocketAddr> {
        self.peers
            .get(id)
            .or_else(|| self.learned.get(id))
            .copied()
    }

    fn send_bytes(&self, bytes: &[u8], addr: SocketAddr) {
        if let Err(err) = self.socket.send_to(bytes, addr) {
            warn!(node = %self.id, %addr, error = %err, "failed to send datagram");
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, msg: Message) -> Result<()> {
        let bytes = message::encode(&msg)?;
        match &msg.dst {
            Destination::Broadcast => {
                for addr in self.peers.values() {
                    self.send_bytes(&bytes, *addr);
                }
            }
            Destination::Node(dst) => match self.address_of(dst) {
                Some(addr) => self.send_bytes(&bytes, addr),
                None => debug!(node = %self.id, %dst, kind = msg.body.kind(), "no address for destination, dropping"),
            },
        }
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_SOCKET_WAIT)))
            .context("failed to set socket read timeout")?;
        let (len, from) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(err) => return Err(err).context("failed to receive datagram"),
        };

        let msg = match message::decode(&self.buf[..len]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(node = %self.id, %from, error = %err, "dropping undecodable datagram");
                return Ok(None);
            }
        };
        if !self.peers.contains_key(&msg.src) {
            self.learned.learn(&msg.src, from);
        }
        Ok(Some(msg))
    }
}
