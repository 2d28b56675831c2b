use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::raft::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse, Rpc,
};
use crate::raft::timer::ElectionTimer;
use crate::raft::{Entry, NodeAddr};
use crate::storage::Store;

/// An RPC the engine wants delivered. The driving loop owns the socket and
/// performs the actual send.
#[derive(Debug)]
pub struct Outbound {
    pub rpc: Rpc,
    pub dest: NodeAddr,
}

/// Per-peer replication bookkeeping, alive only while this node leads.
struct LeaderState {
    /// Index of the next entry to send to each peer.
    next_index: HashMap<NodeAddr, u64>,
    /// Highest index known to be replicated on each peer.
    match_index: HashMap<NodeAddr, u64>,
    /// The `(prev_log_index, entry count)` of the last request sent to each
    /// peer. Responses do not echo this, so it has to be remembered here to
    /// advance `match_index` correctly on success.
    inflight: HashMap<NodeAddr, (u64, u64)>,
}

enum Role {
    Follower,
    Candidate { votes: HashSet<NodeAddr> },
    Leader(LeaderState),
}

/// The per-node Raft state machine.
///
/// The engine is synchronous and single-threaded: the driving loop feeds it
/// decoded RPCs and timer expirations, and it answers with the envelopes to
/// send back out. All durable state flows through the [`Store`], which is
/// written before any reply leaves the engine, so a crash at any point
/// restarts the node into a state it already acknowledged.
pub struct ConsensusEngine {
    id: NodeAddr,
    peers: Vec<NodeAddr>,
    store: Store,
    role: Role,
    commit_index: u64,
    last_applied: u64,
    timer: ElectionTimer,
}

impl ConsensusEngine {
    pub fn new(id: NodeAddr, peers: Vec<NodeAddr>, store: Store, timer: ElectionTimer) -> Self {
        ConsensusEngine {
            id,
            peers,
            store,
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            timer,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.timer.is_expired(now)
    }

    pub fn deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Reacts to the timer firing: a leader heartbeats (advancing the commit
    /// index first), everyone else calls an election.
    pub fn on_tick(&mut self, now: Instant) -> Result<Vec<Outbound>, StoreError> {
        if self.is_leader() {
            self.advance_commit_index();
            let out = self.broadcast_append_entries();
            self.timer.reset_heartbeat(now);
            Ok(out)
        } else {
            self.start_election(now)
        }
    }

    /// Handles one decoded inbound RPC from `sender`.
    pub fn on_receive(
        &mut self,
        rpc: Rpc,
        sender: NodeAddr,
        now: Instant,
    ) -> Result<Vec<Outbound>, StoreError> {
        self.observe_term(rpc.term(), now)?;

        match rpc {
            Rpc::AppendEntries(req) => self.handle_append_entries(req, sender, now),
            Rpc::AppendEntriesReply(res) => {
                self.handle_append_entries_response(res, sender);
                Ok(Vec::new())
            }
            Rpc::RequestVote(req) => self.handle_request_vote(req, sender, now),
            Rpc::RequestVoteReply(res) => Ok(self.handle_request_vote_response(res, sender, now)),
        }
    }

    /// Applies every newly committed entry to the key/value state machine,
    /// in log order.
    pub fn apply_commits(&mut self) -> Result<(), StoreError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self
                .store
                .entry(index)
                .expect("committed entry must exist in the log");
            self.store.apply_kv(&entry.key, &entry.value)?;
            self.last_applied = index;
            info!(index, key = %entry.key, "applied committed entry");
        }
        Ok(())
    }

    /// Any message carrying a higher term immediately moves this node into
    /// that term as a follower, forgetting any vote.
    fn observe_term(&mut self, term: u64, now: Instant) -> Result<(), StoreError> {
        if term > self.store.current_term() {
            info!(
                old_term = self.store.current_term(),
                new_term = term,
                "observed higher term"
            );
            self.store.set_current_term(term)?;
            self.become_follower(now);
        }
        Ok(())
    }

    fn become_follower(&mut self, now: Instant) {
        if !matches!(self.role, Role::Follower) {
            info!(term = self.store.current_term(), "stepping down to follower");
        }
        self.role = Role::Follower;
        self.timer.reset_election(now);
    }

    fn start_election(&mut self, now: Instant) -> Result<Vec<Outbound>, StoreError> {
        let term = self.store.current_term() + 1;
        self.store.set_current_term(term)?;
        self.store.set_voted_for(Some(self.id.clone()))?;

        let mut votes = HashSet::new();
        votes.insert(self.id.clone());
        self.role = Role::Candidate { votes };
        self.timer.reset_election(now);
        info!(term, "election timeout, requesting votes");

        // A single-node cluster elects itself without any round trips.
        if self.votes_reached_majority() {
            return Ok(self.become_leader(now));
        }

        let req = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.store.last_index(),
            last_log_term: self.store.last_term(),
        };
        Ok(self
            .peers
            .iter()
            .map(|peer| Outbound {
                rpc: Rpc::RequestVote(req.clone()),
                dest: peer.clone(),
            })
            .collect())
    }

    fn votes_reached_majority(&self) -> bool {
        match &self.role {
            Role::Candidate { votes } => 2 * votes.len() > self.peers.len() + 1,
            _ => false,
        }
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Outbound> {
        let next = self.store.last_index() + 1;
        self.role = Role::Leader(LeaderState {
            next_index: self.peers.iter().map(|p| (p.clone(), next)).collect(),
            match_index: self.peers.iter().map(|p| (p.clone(), 0)).collect(),
            inflight: HashMap::new(),
        });
        info!(term = self.store.current_term(), "won election, assuming leadership");

        let out = self.broadcast_append_entries();
        self.timer.reset_heartbeat(now);
        out
    }

    /// Builds one AppendEntries request per peer, from that peer's
    /// `next_index` to the end of the log. An up-to-date peer gets an empty
    /// heartbeat.
    fn broadcast_append_entries(&mut self) -> Vec<Outbound> {
        let term = self.store.current_term();
        let last = self.store.last_index();
        let commit = self.commit_index;

        let Role::Leader(state) = &mut self.role else {
            unreachable!("append entries broadcast while not leader");
        };

        let mut out = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let next = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(last + 1)
                .clamp(1, last + 1);
            let prev = self
                .store
                .entry(next - 1)
                .expect("next_index stays within log bounds");
            let entries = self.store.entries_from(next);

            state
                .inflight
                .insert(peer.clone(), (prev.index, entries.len() as u64));
            out.push(Outbound {
                rpc: Rpc::AppendEntries(AppendEntriesRequest {
                    term,
                    leader_id: self.id.clone(),
                    prev_log_index: prev.index,
                    prev_log_term: prev.term,
                    entries,
                    leader_commit_index: commit,
                }),
                dest: peer.clone(),
            });
        }
        out
    }

    /// Finds the highest index replicated on a majority whose entry carries
    /// the current term, and commits up to it. Entries from earlier terms
    /// are never counted directly; they commit only by sitting below a
    /// current-term entry that does.
    fn advance_commit_index(&mut self) {
        let Role::Leader(state) = &self.role else {
            return;
        };
        let current_term = self.store.current_term();
        let cluster = self.peers.len() + 1;

        let mut advanced = None;
        let mut n = self.store.last_index();
        while n > self.commit_index {
            let term = self.store.entry(n).map(|e| e.term).unwrap_or(0);
            if term < current_term {
                // log terms are non-decreasing, nothing above can match either
                break;
            }
            let replicas = 1 + state.match_index.values().filter(|&&m| m >= n).count();
            if 2 * replicas > cluster {
                advanced = Some(n);
                break;
            }
            n -= 1;
        }

        if let Some(n) = advanced {
            debug!(commit_index = n, "advanced commit index");
            self.commit_index = n;
        }
    }

    fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        sender: NodeAddr,
        now: Instant,
    ) -> Result<Vec<Outbound>, StoreError> {
        let term = self.store.current_term();
        let reply = |success: bool, dest: NodeAddr| {
            vec![Outbound {
                rpc: Rpc::AppendEntriesReply(AppendEntriesResponse { term, success }),
                dest,
            }]
        };

        if req.term < term {
            debug!(from = %sender, req_term = req.term, term, "rejecting append entries from stale term");
            return Ok(reply(false, sender));
        }

        // Terms are equal from here on; observe_term already absorbed the
        // higher-term case.
        if matches!(self.role, Role::Candidate { .. }) {
            // a peer claiming leadership in our term won the election
            self.become_follower(now);
        } else if matches!(self.role, Role::Leader(_)) {
            error!(from = %sender, term, "append entries from a second leader in the same term");
            return Ok(Vec::new());
        }
        self.timer.reset_election(now);

        let prev_matches = match self.store.entry(req.prev_log_index) {
            Some(prev) => prev.term == req.prev_log_term,
            None => false,
        };
        if !prev_matches {
            debug!(
                from = %sender,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "log consistency check failed"
            );
            return Ok(reply(false, sender));
        }

        if !batch_is_contiguous(req.prev_log_index, &req.entries) {
            warn!(from = %sender, "rejecting append entries with non-consecutive indices");
            return Ok(reply(false, sender));
        }

        for entry in &req.entries {
            self.store.append_or_replace(entry.clone())?;
        }

        if req.leader_commit_index > self.commit_index {
            self.commit_index = req.leader_commit_index.min(self.store.last_index());
        }

        Ok(reply(true, sender))
    }

    fn handle_append_entries_response(&mut self, res: AppendEntriesResponse, sender: NodeAddr) {
        if res.term < self.store.current_term() {
            debug!(from = %sender, "dropping append entries response from stale term");
            return;
        }
        let Role::Leader(state) = &mut self.role else {
            debug!(from = %sender, "ignoring append entries response while not leader");
            return;
        };

        if res.success {
            // Only a response we remember sending can move the peer forward;
            // duplicates find nothing in flight and change nothing.
            if let Some((prev_log_index, sent)) = state.inflight.remove(&sender) {
                let matched = prev_log_index + sent;
                let match_index = state.match_index.entry(sender.clone()).or_insert(0);
                if matched > *match_index {
                    *match_index = matched;
                }
                let next = *match_index + 1;
                state.next_index.insert(sender, next);
            }
        } else {
            state.inflight.remove(&sender);
            let next = state.next_index.entry(sender).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            // the next heartbeat retries from the lower index
        }
    }

    fn handle_request_vote(
        &mut self,
        req: RequestVoteRequest,
        sender: NodeAddr,
        now: Instant,
    ) -> Result<Vec<Outbound>, StoreError> {
        let term = self.store.current_term();
        let reply = |vote_granted: bool, dest: NodeAddr| {
            vec![Outbound {
                rpc: Rpc::RequestVoteReply(RequestVoteResponse { term, vote_granted }),
                dest,
            }]
        };

        if req.term < term {
            debug!(from = %sender, req_term = req.term, term, "rejecting vote request from stale term");
            return Ok(reply(false, sender));
        }

        let up_to_date = req.last_log_term > self.store.last_term()
            || (req.last_log_term == self.store.last_term()
                && req.last_log_index >= self.store.last_index());
        let vote_free = match self.store.voted_for() {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };

        if vote_free && up_to_date {
            self.store.set_voted_for(Some(req.candidate_id.clone()))?;
            self.timer.reset_election(now);
            info!(candidate = %req.candidate_id, term, "granted vote");
            Ok(reply(true, sender))
        } else {
            debug!(candidate = %req.candidate_id, term, up_to_date, "rejected vote request");
            Ok(reply(false, sender))
        }
    }

    fn handle_request_vote_response(
        &mut self,
        res: RequestVoteResponse,
        sender: NodeAddr,
        now: Instant,
    ) -> Vec<Outbound> {
        if res.term < self.store.current_term() {
            debug!(from = %sender, "dropping vote response from stale term");
            return Vec::new();
        }

        let won = match &mut self.role {
            Role::Candidate { votes } if res.vote_granted => {
                votes.insert(sender);
                true
            }
            _ => false,
        };

        if won && self.votes_reached_majority() {
            self.become_leader(now)
        } else {
            Vec::new()
        }
    }
}

fn batch_is_contiguous(prev_log_index: u64, entries: &[Entry]) -> bool {
    entries
        .iter()
        .enumerate()
        .all(|(i, e)| e.index == prev_log_index + 1 + i as u64)
}
