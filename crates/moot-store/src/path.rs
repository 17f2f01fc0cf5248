//! Slash-separated paths into the hierarchical store.
//!
//! `/` is the root; `/a/b` names the entry `b` inside the object `a`.
//! Paths serialize as their string form so they read naturally in JSON
//! payloads.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Path parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// An empty segment, e.g. `/a//b` or a trailing slash.
    #[error("empty segment in path {0:?}")]
    EmptySegment(String),
}

/// A path into the store tree.
///
/// The root path has no segments. Ordering is lexicographic by segment,
/// so a parent sorts before its children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<String>);

impl Path {
    /// The root path (`/`).
    pub fn root() -> Self {
        Path(Vec::new())
    }

    /// Parse a path from its slash-separated form.
    ///
    /// A leading slash is optional; `""` and `"/"` both name the root.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Path::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(s.to_string()));
            }
            segments.push(segment.to_string());
        }
        Ok(Path(segments))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The path one level deeper.
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Path::parse(&s).map_err(D::Error::custom)
    }
}
