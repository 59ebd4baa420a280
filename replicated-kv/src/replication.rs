//! Log replication.
//!
//! The leader pushes: every accepted write is appended, applied, and
//! broadcast as an announcement carrying `(term, index, entry)`, and the
//! newest entry is re-broadcast every `heartbeat_interval` even when idle.
//!
//! A follower only ever accepts the entry directly after its own last index.
//! When an announcement reveals a gap, it asks the leader point-to-point for
//! the first missing entry and keeps asking, one entry at a time, until it has
//! caught up with the newest index the leader advertised.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::log::LogEntry;
use crate::message::{Body, Message};
use crate::node::{Node, Outbox, Phase};
use crate::types::{LogIndex, NodeId, Role, Term};

impl Node {
    /// Leader side of a client write: append, apply, and broadcast.
    pub(crate) fn accept_write(&mut self, entry: LogEntry, out: &mut Outbox) -> LogIndex {
        let index = self.state.add_to_log(entry.clone());
        debug!(node = %self.id(), index, key = %entry.key, "accepted write");
        out.push(Message::broadcast(
            self.id().clone(),
            Body::Announce {
                term: self.state.term,
                leader: self.id().clone(),
                index,
                entry: Some(entry),
            },
        ));
        index
    }

    /// Re-broadcasts the newest entry when the heartbeat is due.
    pub(crate) fn heartbeat_tick(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Leader { heartbeat } = &mut self.state.phase else {
            return;
        };
        if heartbeat.is_expired(now) {
            heartbeat.rearm(now);
            trace!(node = %self.config.id(), "sending heartbeat");
            out.push(self.announce_latest());
        }
    }

    /// Announcement of this replica's newest entry (or of an empty log).
    pub(crate) fn announce_latest(&self) -> Message {
        let (index, entry) = match self.state.log.last() {
            Some((index, entry)) => (index, Some(entry.clone())),
            None => (self.last_index(), None),
        };
        Message::broadcast(
            self.id().clone(),
            Body::Announce {
                term: self.state.term,
                leader: self.id().clone(),
                index,
                entry,
            },
        )
    }

    /// Handles a leadership claim, heartbeat, or replicated entry.
    ///
    /// The claim is accepted when its term is newer than ours, or equal to
    /// ours while we either know no leader or already follow the sender.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_announce(
        &mut self,
        src: NodeId,
        term: Term,
        leader: NodeId,
        index: LogIndex,
        entry: Option<LogEntry>,
        now: Instant,
        out: &mut Outbox,
    ) {
        if leader != src {
            debug!(node = %self.id(), %src, %leader, "ignoring announcement relayed for another leader");
            return;
        }
        if term < self.state.term {
            debug!(node = %self.id(), %src, term, current_term = self.state.term, "ignoring stale announcement");
            return;
        }

        let following = self.state.leader.as_deref() == Some(src.as_str());
        if term > self.state.term || (!following && self.state.leader.is_none()) {
            self.adopt_leader(src, term);
        } else if !following {
            warn!(
                node = %self.id(),
                %src,
                term,
                leader = ?self.state.leader,
                "conflicting leadership claim for current term"
            );
            return;
        }

        self.rearm_liveness(now);
        self.state.leader_index = self.state.leader_index.max(index);
        self.follow_entry(index, entry, out);
    }

    /// Applies the entry if it is the next one, otherwise requests the gap.
    fn follow_entry(&mut self, index: LogIndex, entry: Option<LogEntry>, out: &mut Outbox) {
        let local = self.last_index();

        if index == local {
            trace!(node = %self.id(), index, "up to date");
        } else if index == local + 1 {
            let Some(entry) = entry else {
                debug!(node = %self.id(), index, "announcement for next index carried no entry");
                return;
            };
            let applied = self.state.add_to_log(entry);
            debug!(node = %self.id(), index = applied, "applied replicated entry");
            if self.state.leader_index > applied {
                self.request_catch_up(out);
            }
        } else if index > local + 1 {
            debug!(node = %self.id(), index, local, "gap detected, requesting catch-up");
            self.request_catch_up(out);
        } else {
            warn!(node = %self.id(), index, local, "announcement behind local log, ignoring");
        }
    }

    fn request_catch_up(&self, out: &mut Outbox) {
        let Some(leader) = &self.state.leader else {
            return;
        };
        out.push(Message::to(
            self.id().clone(),
            leader.clone(),
            Body::CatchUp {
                index: self.last_index() + 1,
            },
        ));
    }

    /// Leader side of catch-up: reply point-to-point with the requested entry.
    pub(crate) fn on_catch_up(&mut self, src: NodeId, index: LogIndex, out: &mut Outbox) {
        if self.role() != Role::Leader {
            debug!(node = %self.id(), %src, index, "ignoring catch-up request, not leader");
            return;
        }
        let Some(entry) = self.state.log.get(index) else {
            debug!(node = %self.id(), %src, index, last_index = self.last_index(), "catch-up request beyond log");
            return;
        };
        out.push(Message::to(
            self.id().clone(),
            src,
            Body::Announce {
                term: self.state.term,
                leader: self.id().clone(),
                index,
                entry: Some(entry.clone()),
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ClusterConfig, Timing};
    use crate::types::NO_INDEX;

    fn node(id: &str, peers: &[&str], now: Instant) -> Node {
        let peers = peers.iter().map(|s| s.to_string()).collect();
        Node::with_seed(ClusterConfig::new(id, peers).unwrap(), Timing::default(), 3, now)
    }

    fn announce(src: &str, term: Term, index: LogIndex, entry: Option<(&str, &str)>) -> Message {
        Message::broadcast(
            src,
            Body::Announce {
                term,
                leader: src.into(),
                index,
                entry: entry.map(|(k, v)| LogEntry::new(k, v)),
            },
        )
    }

    fn catch_up(src: &str, dst: &str, index: LogIndex) -> Message {
        Message::to(src, dst, Body::CatchUp { index })
    }

    /// A leader elected by a single vote in a three-replica cluster.
    fn leader(id: &str, peers: &[&str], now: Instant) -> (Node, Instant) {
        let mut node = node(id, peers, now);
        let t = now + node.timing().initial_leader_timeout;
        node.tick(t);
        node.handle(Message::to(peers[0], id, Body::Vote { term: 1 }), t);
        assert!(node.is_leader());
        (node, t)
    }

    fn put(node: &mut Node, key: &str, value: &str, now: Instant) -> Outbox {
        node.handle(
            Message::to(
                "client",
                node.id().clone(),
                Body::Put {
                    mid: "m".into(),
                    key: key.into(),
                    value: value.into(),
                },
            ),
            now,
        )
    }

    #[test]
    fn test_leader_write_broadcasts_entry() {
        let now = Instant::now();
        let (mut a, t) = leader("A", &["B", "C"], now);

        let out = put(&mut a, "x", "1", t);
        assert_eq!(out[0], announce("A", 1, 0, Some(("x", "1"))));
        assert_eq!(a.last_index(), 0);
        assert_eq!(a.store().get("x"), Some("1"));
    }

    #[test]
    fn test_leader_heartbeat_cadence() {
        let now = Instant::now();
        let (mut a, t) = leader("A", &["B", "C"], now);
        put(&mut a, "x", "1", t);

        assert!(a.tick(t + Duration::from_millis(499)).is_empty());
        let out = a.tick(t + Duration::from_millis(500));
        assert_eq!(out, vec![announce("A", 1, 0, Some(("x", "1")))]);
        assert!(a.tick(t + Duration::from_millis(600)).is_empty());
    }

    #[test]
    fn test_follower_applies_contiguous_entries() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, NO_INDEX, None), now);

        assert!(b.handle(announce("A", 1, 0, Some(("x", "1"))), now).is_empty());
        assert!(b.handle(announce("A", 1, 1, Some(("y", "2"))), now).is_empty());
        assert_eq!(b.last_index(), 1);
        assert_eq!(b.store().get("y"), Some("2"));

        // Steady-state heartbeat is a no-op.
        assert!(b.handle(announce("A", 1, 1, Some(("y", "2"))), now).is_empty());
        assert_eq!(b.last_index(), 1);
    }

    #[test]
    fn test_gap_triggers_catch_up_request() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, NO_INDEX, None), now);

        let out = b.handle(announce("A", 1, 3, Some(("z", "9"))), now);
        assert_eq!(out, vec![catch_up("B", "A", 0)]);
        assert_eq!(b.last_index(), NO_INDEX);
    }

    #[test]
    fn test_stale_index_is_ignored() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, 0, Some(("x", "1"))), now);
        b.handle(announce("A", 1, 1, Some(("x", "2"))), now);

        assert!(b.handle(announce("A", 1, 0, Some(("x", "other"))), now).is_empty());
        assert_eq!(b.log().get(0), Some(&LogEntry::new("x", "1")));
        assert_eq!(b.store().get("x"), Some("2"));
    }

    #[test]
    fn test_new_leader_with_higher_term_is_adopted() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, NO_INDEX, None), now);

        b.handle(announce("C", 2, 0, Some(("x", "1"))), now);
        assert_eq!(b.leader().map(String::as_str), Some("C"));
        assert_eq!(b.term(), 2);
        // The entry in the adopting announcement is applied too.
        assert_eq!(b.last_index(), 0);
    }

    #[test]
    fn test_conflicting_same_term_claim_is_dropped() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, NO_INDEX, None), now);

        assert!(b.handle(announce("C", 1, 0, Some(("x", "1"))), now).is_empty());
        assert_eq!(b.leader().map(String::as_str), Some("A"));
        assert_eq!(b.last_index(), NO_INDEX);
    }

    #[test]
    fn test_relayed_claim_is_dropped() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        let relayed = Message::broadcast(
            "C",
            Body::Announce {
                term: 4,
                leader: "A".into(),
                index: NO_INDEX,
                entry: None,
            },
        );
        b.handle(relayed, now);
        assert_eq!(b.term(), 0);
        assert_eq!(b.leader(), None);
    }

    #[test]
    fn test_heartbeats_hold_off_elections() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, NO_INDEX, None), now);

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_millis(500);
            b.handle(announce("A", 1, NO_INDEX, None), t);
            assert!(b.tick(t).is_empty());
        }
        assert_eq!(b.role(), Role::Follower);

        let out = b.tick(t + b.timing().leader_timeout);
        assert_eq!(b.role(), Role::Candidate);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_leader_serves_catch_up() {
        let now = Instant::now();
        let (mut a, t) = leader("A", &["B", "C"], now);
        put(&mut a, "x", "1", t);
        put(&mut a, "y", "2", t);

        let out = a.handle(catch_up("B", "A", 1), t);
        assert_eq!(
            out,
            vec![Message::to(
                "A",
                "B",
                Body::Announce {
                    term: 1,
                    leader: "A".into(),
                    index: 1,
                    entry: Some(LogEntry::new("y", "2")),
                }
            )]
        );
        assert!(a.handle(catch_up("B", "A", 5), t).is_empty());
    }

    #[test]
    fn test_follower_ignores_catch_up_requests() {
        let now = Instant::now();
        let mut b = node("B", &["A", "C"], now);
        b.handle(announce("A", 1, 0, Some(("x", "1"))), now);
        assert!(b.handle(catch_up("C", "B", 0), now).is_empty());
    }

    #[test]
    fn test_catch_up_converges_in_order() {
        let now = Instant::now();
        let (mut a, t) = leader("A", &["B", "C"], now);
        let mut b = node("B", &["A", "C"], now);

        // Follower at index k = 1.
        for (k, v) in [("a", "0"), ("b", "1")] {
            let out = put(&mut a, k, v, t);
            b.handle(out[0].clone(), t);
        }
        assert_eq!(b.last_index(), 1);

        // Leader moves five entries ahead while the follower hears nothing.
        for i in 2..7 {
            put(&mut a, &format!("k{i}"), &i.to_string(), t);
        }

        let mut inbound = vec![a.announce_latest()];
        let mut rounds = 0;
        while let Some(msg) = inbound.pop() {
            for request in b.handle(msg, t) {
                assert!(matches!(request.body, Body::CatchUp { .. }));
                inbound.extend(a.handle(request, t));
            }
            rounds += 1;
            assert!(rounds < 20, "catch-up did not converge");
        }

        assert_eq!(b.last_index(), a.last_index());
        assert_eq!(b.log(), a.log());
        assert_eq!(b.store(), a.store());
    }
}
