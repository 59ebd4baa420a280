//! Leader election.
//!
//! A follower that hears nothing from a leader within its liveness timeout
//! becomes a candidate for the next term. It votes for itself, broadcasts a
//! vote request, re-broadcasts it every `vote_request_interval`, and gives up
//! once its randomized election timeout elapses. A quorum of votes for the
//! same term makes it leader; an authoritative announcement from another
//! replica with a term at least as high makes it concede.
//!
//! Voting is a follower sub-state ([`Ballot`]) rather than a blocking loop:
//! the voter keeps serving clients and answering peers while it re-sends its
//! vote every `vote_resend_interval`, until a leader announces itself, a
//! higher-term candidate supersedes the ballot, or its own liveness timeout
//! fires.
//!
//! Safety rests on each replica casting at most one vote per term
//! (`voted_for`), so at most one candidate can gather a quorum for a term.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info};

use crate::message::{Body, Message};
use crate::node::{Node, Outbox, Phase};
use crate::timer::{Timer, random_timeout};
use crate::types::{LogIndex, NO_INDEX, NodeId, Role, Term};

/// One election attempt by this replica.
#[derive(Debug, Clone)]
pub(crate) struct Campaign {
    /// Term this replica takes if it wins.
    pub(crate) term: Term,
    /// Replicas that granted a vote for `term`, this one included.
    pub(crate) votes: BTreeSet<NodeId>,
    /// Randomized bound on the attempt.
    pub(crate) deadline: Timer,
    pub(crate) resend: Timer,
}

/// An outstanding vote granted to another replica.
#[derive(Debug, Clone)]
pub(crate) struct Ballot {
    pub(crate) term: Term,
    pub(crate) candidate: NodeId,
    pub(crate) resend: Timer,
}

impl Node {
    /// True when a follower has gone a full liveness timeout without hearing from a leader.
    pub(crate) fn election_due(&self, now: Instant) -> bool {
        self.role() == Role::Follower && self.state.heartbeat_deadline.is_expired(now)
    }

    /// Becomes a candidate for the next unclaimed term and broadcasts a vote request.
    pub(crate) fn begin_election(&mut self, now: Instant, out: &mut Outbox) {
        let id = self.id().clone();
        let last_vote = self.state.voted_for.as_ref().map_or(0, |(term, _)| *term);
        let term = self.state.term.max(last_vote).saturating_add(1);
        let timeout = random_timeout(&mut self.rng, &self.timing.election_timeout);

        self.state.leader = None;
        self.state.seen_election = true;
        self.state.voted_for = Some((term, id.clone()));
        self.state.phase = Phase::Candidate(Campaign {
            term,
            votes: BTreeSet::from([id.clone()]),
            deadline: Timer::new(now, timeout),
            resend: Timer::new(now, self.timing.vote_request_interval),
        });
        self.rearm_liveness(now);

        info!(
            node = %id,
            term,
            last_index = self.last_index(),
            timeout_ms = timeout.as_millis() as u64,
            "starting election"
        );
        out.push(self.vote_request(term));

        if self.config.quorum() <= 1 {
            self.become_leader(now, out);
        }
    }

    /// Gives up a timed-out election or re-broadcasts the vote request when due.
    pub(crate) fn campaign_tick(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Candidate(campaign) = &mut self.state.phase else {
            return;
        };

        if campaign.deadline.is_expired(now) {
            let term = campaign.term;
            let votes = campaign.votes.len();
            self.state.phase = Phase::Follower { ballot: None };
            self.rearm_liveness(now);
            info!(node = %self.id(), term, votes, "election timed out, reverting to follower");
            return;
        }

        if campaign.resend.is_expired(now) {
            campaign.resend.rearm(now);
            let term = campaign.term;
            out.push(self.vote_request(term));
        }
    }

    /// Re-sends an outstanding vote when due.
    pub(crate) fn ballot_tick(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Follower {
            ballot: Some(ballot),
        } = &mut self.state.phase
        else {
            return;
        };
        if ballot.resend.is_expired(now) {
            ballot.resend.rearm(now);
            let vote = Message::to(
                self.config.id().clone(),
                ballot.candidate.clone(),
                Body::Vote { term: ballot.term },
            );
            out.push(vote);
        }
    }

    /// Counts a vote toward the current campaign.
    pub(crate) fn on_vote(&mut self, src: NodeId, term: Term, now: Instant, out: &mut Outbox) {
        let quorum = self.config.quorum();
        let Phase::Candidate(campaign) = &mut self.state.phase else {
            debug!(node = %self.config.id(), %src, term, "ignoring vote, not campaigning");
            return;
        };
        if term != campaign.term {
            debug!(node = %self.config.id(), %src, term, campaign_term = campaign.term, "ignoring vote for another term");
            return;
        }

        campaign.votes.insert(src);
        let votes = campaign.votes.len();
        debug!(node = %self.config.id(), term, votes, quorum, "vote received");
        if votes >= quorum {
            self.become_leader(now, out);
        }
    }

    /// Grants or refuses a vote.
    ///
    /// A vote is granted only when the candidate's proposed term is newer than
    /// ours, its log reaches at least as far as ours, and we have not voted
    /// for a different candidate in that term or a later one.
    pub(crate) fn on_vote_request(
        &mut self,
        src: NodeId,
        term: Term,
        candidate: NodeId,
        last_index: LogIndex,
        now: Instant,
        out: &mut Outbox,
    ) {
        if candidate != src {
            debug!(node = %self.id(), %src, %candidate, "ignoring vote request relayed for another candidate");
            return;
        }
        if term <= self.state.term {
            debug!(node = %self.id(), %candidate, term, current_term = self.state.term, "refusing vote: stale term");
            return;
        }
        let local_index = self.last_index();
        if last_index < local_index {
            debug!(node = %self.id(), %candidate, last_index, local_index, "refusing vote: candidate log is behind");
            return;
        }
        if let Some((voted_term, voted)) = &self.state.voted_for {
            if *voted_term > term || (*voted_term == term && *voted != candidate) {
                debug!(node = %self.id(), %candidate, term, voted_term, %voted, "refusing vote: already voted");
                return;
            }
        }

        let renewing = matches!(
            &self.state.phase,
            Phase::Follower { ballot: Some(ballot) } if ballot.term == term && ballot.candidate == candidate
        );
        if !renewing {
            let previous = self.role();
            self.state.voted_for = Some((term, candidate.clone()));
            self.state.leader = None;
            self.state.seen_election = true;
            self.state.phase = Phase::Follower {
                ballot: Some(Ballot {
                    term,
                    candidate: candidate.clone(),
                    resend: Timer::new(now, self.timing.vote_resend_interval),
                }),
            };
            self.rearm_liveness(now);
            info!(node = %self.id(), %candidate, term, %previous, "granted vote");
        }

        out.push(Message::to(self.id().clone(), candidate, Body::Vote { term }));
    }

    /// Follows `leader` at `term`, abandoning any campaign, ballot, or leadership.
    pub(crate) fn adopt_leader(&mut self, leader: NodeId, term: Term) {
        let previous = self.role();
        self.state.term = self.state.term.max(term);
        self.state.phase = Phase::Follower { ballot: None };
        self.state.seen_election = true;
        self.state.leader_index = NO_INDEX;
        info!(
            node = %self.id(),
            %leader,
            term = self.state.term,
            %previous,
            "following leader"
        );
        self.state.leader = Some(leader);
    }

    fn become_leader(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Candidate(campaign) = &self.state.phase else {
            return;
        };
        let term = campaign.term;
        let votes = campaign.votes.len();

        self.state.term = self.state.term.max(term);
        self.state.leader = Some(self.id().clone());
        self.state.phase = Phase::Leader {
            heartbeat: Timer::new(now, self.timing.heartbeat_interval),
        };
        info!(node = %self.id(), term, votes, last_index = self.last_index(), "won election, now leader");
        out.push(self.announce_latest());
    }

    fn vote_request(&self, term: Term) -> Message {
        Message::broadcast(
            self.id().clone(),
            Body::VoteRequest {
                term,
                candidate: self.id().clone(),
                last_index: self.last_index(),
            },
        )
    }
}
