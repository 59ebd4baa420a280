//! Shared harness for integration tests: a cluster of real worker threads
//! connected through an in-process [`LocalNetwork`].

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use replicated_kv::client::Client;
use replicated_kv::config::{ClusterConfig, Timing};
use replicated_kv::node::{Node, NodeStatus};
use replicated_kv::runtime::{NodeHandle, spawn_node};
use replicated_kv::transport::{LocalEndpoint, LocalNetwork};
use replicated_kv::types::{NodeId, Role};

/// Timing scaled down so elections settle in well under a second.
pub fn fast_timing() -> Timing {
    Timing {
        initial_leader_timeout: Duration::from_millis(150),
        leader_timeout: Duration::from_millis(600),
        election_timeout: Duration::from_millis(150)..Duration::from_millis(350),
        vote_request_interval: Duration::from_millis(50),
        vote_resend_interval: Duration::from_millis(80),
        heartbeat_interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        ..Timing::default()
    }
}

pub const SETTLE: Duration = Duration::from_secs(10);

pub struct TestCluster {
    network: LocalNetwork,
    handles: Vec<NodeHandle>,
    ids: Vec<NodeId>,
}

impl TestCluster {
    /// Spawns one replica per id, each peered with all the others.
    pub fn spawn(ids: &[&str]) -> Result<Self> {
        let network = LocalNetwork::new();
        let ids: Vec<NodeId> = ids.iter().map(|id| id.to_string()).collect();
        let mut handles = Vec::new();

        for (seed, id) in ids.iter().enumerate() {
            let peers = ids.iter().filter(|p| *p != id).cloned().collect();
            let config = ClusterConfig::new(id.clone(), peers)?;
            let node = Node::with_seed(config, fast_timing(), seed as u64 + 1, Instant::now());
            handles.push(spawn_node(node, network.join_replica(id.clone()))?);
        }

        Ok(Self {
            network,
            handles,
            ids,
        })
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// A client that starts at `first` and knows every replica.
    pub fn client(&self, name: &str, first: &str) -> Result<Client<LocalEndpoint>> {
        let mut replicas = vec![first.to_string()];
        replicas.extend(self.ids.iter().filter(|id| *id != first).cloned());
        Ok(Client::new(name, self.network.join_client(name), replicas)?
            .with_reply_timeout(Duration::from_millis(300))
            .with_retry_delay(Duration::from_millis(100))
            .with_max_attempts(40))
    }

    fn handle(&self, id: &str) -> &NodeHandle {
        self.handles
            .iter()
            .find(|h| h.id() == id)
            .unwrap_or_else(|| panic!("no replica {id}"))
    }

    pub fn status(&self, id: &str) -> Result<NodeStatus> {
        self.handle(id).status()
    }

    /// Waits until exactly one of `among` is leader and returns it.
    pub fn wait_for_single_leader_among(&self, among: &[&str], timeout: Duration) -> Result<NodeId> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for a single leader among {among:?}");
            }

            let mut leaders = Vec::new();
            for id in among {
                if let Ok(status) = self.status(id) {
                    if status.role == Role::Leader {
                        leaders.push(status.node_id);
                    }
                }
            }
            if leaders.len() == 1 {
                return Ok(leaders.remove(0));
            }

            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn wait_for_single_leader(&self, timeout: Duration) -> Result<NodeId> {
        let ids: Vec<&str> = self.ids.iter().map(String::as_str).collect();
        self.wait_for_single_leader_among(&ids, timeout)
    }

    /// Waits until the whole cluster agrees on one leader, tolerating leaders
    /// that are deposed while the cluster settles.
    pub fn wait_for_stable_leader(&self, timeout: Duration) -> Result<NodeId> {
        let ids: Vec<&str> = self.ids.iter().map(String::as_str).collect();
        let start = Instant::now();
        while start.elapsed() < timeout {
            let Ok(leader) = self.wait_for_single_leader(Duration::from_secs(1)) else {
                continue;
            };
            if self
                .wait_for_leader_consensus(&ids, &leader, Duration::from_secs(1))
                .is_ok()
            {
                return Ok(leader);
            }
        }
        bail!("timeout waiting for a stable leader")
    }

    /// Waits until every replica in `among` recognizes `leader`.
    pub fn wait_for_leader_consensus(&self, among: &[&str], leader: &str, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "leader consensus", |status| {
            !among.contains(&status.node_id.as_str()) || status.leader.as_deref() == Some(leader)
        })
    }

    /// Waits until every replica in `among` has `key` set to `value`.
    pub fn wait_for_value(&self, among: &[&str], key: &str, value: &str, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "replicated value", |status| {
            !among.contains(&status.node_id.as_str()) || status.store.get(key).map(String::as_str) == Some(value)
        })
    }

    /// Polls every replica's status until all satisfy `check`.
    pub fn wait_for(&self, timeout: Duration, what: &str, check: impl Fn(&NodeStatus) -> bool) -> Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for {what}");
            }
            let mut satisfied = true;
            for handle in &self.handles {
                match handle.status() {
                    Ok(status) if check(&status) => {}
                    _ => {
                        satisfied = false;
                        break;
                    }
                }
            }
            if satisfied {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn shutdown(self) -> Result<()> {
        for handle in self.handles {
            handle.shutdown()?;
        }
        Ok(())
    }
}
