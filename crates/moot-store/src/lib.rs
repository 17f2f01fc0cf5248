//! moot-store: the hierarchical key/value tree behind the agency.
//!
//! Two views of this store exist inside every agent: the *spearhead* (the
//! leader's optimistic view, reflecting the full local log) and the *read
//! store* (the committed view). Both are plain [`Store`] values; the agency
//! decides which log prefix each one replays.
//!
//! The store guarantees deterministic application: feeding the same sequence
//! of [`Mutation`]s to two fresh stores yields identical trees, which is what
//! lets every peer converge by replaying the replicated log.

pub mod path;
pub mod store;

pub use path::{Path, PathError};
pub use store::{Guard, Mutation, Op, ReadView, Store};
