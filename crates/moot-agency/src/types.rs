//! Core agency types: terms, log indices, peer ids, log entries, RPC bodies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Election term (monotonically non-decreasing).
///
/// Terms are the agency's logical clock: each term has at most one leader,
/// and a peer starting an election increments its term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed; 0 is the "no entry" sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Peer identifier: a dense index in `[0, cluster_size)`.
///
/// Dense ids let the leader keep its confirmation state in a plain vector
/// indexed by peer, and double as the index into the endpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// One replicated log entry.
///
/// The payload is opaque to the log: the JSON serialization of a single
/// store mutation, interpreted only when a store replays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: Bytes) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Peer role within the constituent state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Vote solicitation, sent by a candidate to every other peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,

    /// Peer requesting the vote.
    pub candidate_id: PeerId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,

    /// Peer-endpoint gossip: the candidate's view of the endpoint table,
    /// indexed by peer id. Receivers merge it into their own table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,
}

/// Vote reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself.
    pub term: Term,

    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// Replication RPC: entries to store, or a heartbeat when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's id, so followers can redirect clients.
    pub leader_id: PeerId,

    /// Index of the entry immediately preceding the batch.
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,

    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<LogEntry>,

    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Replication reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself.
    pub term: Term,

    /// Whether the follower held a matching entry at
    /// `prev_log_index/prev_log_term` and stored the batch.
    pub success: bool,
}

/// Acknowledgement of an accepted write.
///
/// Every payload got a log index; `applied[i]` reports whether payload `i`'s
/// guards held against the spearhead. `indices[i]` is what callers hand to
/// `wait_for` to learn when the outcome is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub leader: PeerId,
    pub applied: Vec<bool>,
    pub indices: Vec<LogIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        assert!(Term(3) > Term(2));
        assert_eq!(Term(7).next(), Term(8));
        assert_eq!(Term::ZERO.as_u64(), 0);
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex(10) > LogIndex(9));
        assert_eq!(LogIndex(4).next(), LogIndex(5));
        assert_eq!(LogIndex(4).prev(), Some(LogIndex(3)));
        assert_eq!(LogIndex::ZERO.prev(), None);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Term(2).to_string(), "T2");
        assert_eq!(LogIndex(11).to_string(), "I11");
        assert_eq!(PeerId(0).to_string(), "P0");
        assert_eq!(Role::Candidate.to_string(), "Candidate");
    }

    #[test]
    fn test_vote_request_endpoints_optional_on_wire() {
        let req = RequestVoteRequest {
            term: Term(1),
            candidate_id: PeerId(0),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
            endpoints: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("endpoints"));
    }
}
