//! moot-agency: the replicated configuration agency.
//!
//! A small cluster of peers serializes configuration-style writes against a
//! hierarchical key/value store using a Raft-family protocol: every
//! committed write is durable on a majority, totally ordered, and observed
//! in the same order everywhere.
//!
//! The pieces, leaves first:
//! - [`log::LogStore`]: the durable, contiguous `(index, term, payload)`
//!   sequence.
//! - [`moot_store::Store`]: the hierarchical tree; each agent keeps two
//!   views (spearhead and read store) derived from the log.
//! - [`constituent::Constituent`]: the follower/candidate/leader role
//!   machine with durable term and vote.
//! - [`agent::Agent`]: the orchestrator, handling client writes and reads,
//!   the replication driver, commit advancement on quorum, and waiters.
//!
//! The RPC transport is pluggable through [`transport::Transport`]; the
//! bundled in-memory transport runs whole clusters in one process.

pub mod agent;
pub mod config;
pub mod constituent;
pub mod error;
pub mod log;
pub mod transport;
pub mod types;

mod replication;
mod rpc;
mod waiter;

pub use agent::Agent;
pub use config::AgencyConfig;
pub use error::{AgencyError, Result};
pub use types::*;
