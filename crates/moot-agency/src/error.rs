//! Agency error types.

use thiserror::Error;

use crate::types::{LogIndex, PeerId, Term};

/// Agency errors.
#[derive(Error, Debug)]
pub enum AgencyError {
    /// Not the leader; the client should redirect to `leader` if known.
    #[error("not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<PeerId> },

    /// An incoming RPC carried a term lower than ours.
    #[error("stale term (current: {current}, request: {request})")]
    StaleTerm { current: Term, request: Term },

    /// No local entry matches the leader's `prev_log_index/prev_log_term`;
    /// the leader will back off and retry from a lower index.
    #[error("log mismatch at {prev_log_index} (leader expected term {prev_log_term})")]
    LogMismatch {
        prev_log_index: LogIndex,
        prev_log_term: Term,
    },

    /// A durable write (log append, truncation, or vote) failed. Fatal for
    /// this agent instance.
    #[error("persistence failure: {source}")]
    Persistence { source: std::io::Error },

    /// Invalid agency configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Log codec failure while framing durable records.
    #[error("log codec error: {source}")]
    Codec {
        #[from]
        source: bincode::Error,
    },

    /// Payload (de)serialization failure.
    #[error("payload error: {source}")]
    Payload {
        #[from]
        source: serde_json::Error,
    },

    /// I/O error outside the durability path (transport plumbing).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The agent is shutting down.
    #[error("agent is shutting down")]
    Shutdown,

    /// A broken internal invariant (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

/// Agency result type.
pub type Result<T> = std::result::Result<T, AgencyError>;
