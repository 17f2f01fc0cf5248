//! The store tree and its guarded mutations.
//!
//! A [`Mutation`] is the unit that travels through the replicated log: a set
//! of writes that apply atomically when every guard holds. Application is
//! deterministic, so replaying the same log prefix always reproduces the
//! same tree.

use crate::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single write at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Replace the value at the path, materializing intermediate objects.
    Set(Value),
    /// Remove the entry at the path. Removing an absent path is a no-op.
    Remove,
}

/// A precondition at a path, checked before any write of the mutation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// The value at the path deep-equals the given one.
    Is(Value),
    /// The path exists (`true`) or does not (`false`).
    Exists(bool),
}

/// One log payload: writes guarded by preconditions.
///
/// Either every guard holds and all writes apply in order, or the store is
/// left untouched at this position in the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub writes: Vec<(Path, Op)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<(Path, Guard)>,
}

impl Mutation {
    /// A single unguarded `set`.
    pub fn set(path: Path, value: Value) -> Self {
        Mutation {
            writes: vec![(path, Op::Set(value))],
            guards: Vec::new(),
        }
    }

    /// A single unguarded `remove`.
    pub fn remove(path: Path) -> Self {
        Mutation {
            writes: vec![(path, Op::Remove)],
            guards: Vec::new(),
        }
    }

    /// Add a guard.
    pub fn guarded(mut self, path: Path, guard: Guard) -> Self {
        self.guards.push((path, guard));
        self
    }
}

/// Result of a multi-path read.
///
/// `success[i]` is `false` only when resolving `queries[i]` descended through
/// a non-object; an absent path is a successful read of `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadView {
    pub success: Vec<bool>,
    pub results: Vec<Value>,
}

/// Outcome of resolving a path against the tree.
enum Resolved<'a> {
    Found(&'a Value),
    Absent,
    /// Traversal hit a non-object before the final segment.
    Blocked,
}

/// The hierarchical key/value tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Store {
    root: Value,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            root: Value::Object(Map::new()),
        }
    }
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// The whole tree, for inspection.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Apply a batch of mutations in order.
    ///
    /// Returns one flag per mutation: `true` when its guards held and its
    /// writes ran. A `false` leaves the store unchanged at that position;
    /// later mutations in the batch still run.
    pub fn apply(&mut self, batch: &[Mutation]) -> Vec<bool> {
        batch.iter().map(|m| self.apply_one(m)).collect()
    }

    fn apply_one(&mut self, mutation: &Mutation) -> bool {
        for (path, guard) in &mutation.guards {
            if !self.check(path, guard) {
                return false;
            }
        }
        for (path, op) in &mutation.writes {
            match op {
                Op::Set(value) => self.set(path, value.clone()),
                Op::Remove => self.remove(path),
            }
        }
        true
    }

    /// Evaluate read queries against the current tree.
    pub fn read(&self, queries: &[Path]) -> ReadView {
        let mut success = Vec::with_capacity(queries.len());
        let mut results = Vec::with_capacity(queries.len());
        for path in queries {
            match self.resolve(path) {
                Resolved::Found(value) => {
                    success.push(true);
                    results.push(value.clone());
                }
                Resolved::Absent => {
                    success.push(true);
                    results.push(Value::Null);
                }
                Resolved::Blocked => {
                    success.push(false);
                    results.push(Value::Null);
                }
            }
        }
        ReadView { success, results }
    }

    /// Look up a single path.
    pub fn get(&self, path: &Path) -> Option<&Value> {
        match self.resolve(path) {
            Resolved::Found(value) => Some(value),
            _ => None,
        }
    }

    fn check(&self, path: &Path, guard: &Guard) -> bool {
        match guard {
            Guard::Is(expected) => matches!(self.resolve(path), Resolved::Found(v) if v == expected),
            Guard::Exists(wanted) => {
                matches!(self.resolve(path), Resolved::Found(_)) == *wanted
            }
        }
    }

    fn resolve(&self, path: &Path) -> Resolved<'_> {
        let mut current = &self.root;
        for segment in path.segments() {
            match current {
                Value::Object(map) => match map.get(segment) {
                    Some(next) => current = next,
                    None => return Resolved::Absent,
                },
                _ => return Resolved::Blocked,
            }
        }
        Resolved::Found(current)
    }

    fn set(&mut self, path: &Path, value: Value) {
        if path.is_root() {
            self.root = value;
            return;
        }
        let mut current = &mut self.root;
        let (last, prefix) = path.segments().split_last().expect("non-root path");
        for segment in prefix {
            // A scalar in the way is replaced by an object.
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = current
                .as_object_mut()
                .expect("just materialized")
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current
            .as_object_mut()
            .expect("just materialized")
            .insert(last.clone(), value);
    }

    fn remove(&mut self, path: &Path) {
        if path.is_root() {
            self.root = Value::Object(Map::new());
            return;
        }
        let (last, prefix) = path.segments().split_last().expect("non-root path");
        let mut current = &mut self.root;
        for segment in prefix {
            match current {
                Value::Object(map) => match map.get_mut(segment) {
                    Some(next) => current = next,
                    None => return,
                },
                _ => return,
            }
        }
        if let Value::Object(map) = current {
            map.remove(last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let mut store = Store::new();
        let applied = store.apply(&[Mutation::set(path("/a/b"), json!(42))]);
        assert_eq!(applied, vec![true]);
        assert_eq!(store.get(&path("/a/b")), Some(&json!(42)));
        assert_eq!(store.get(&path("/a")), Some(&json!({"b": 42})));
    }

    #[test]
    fn test_set_materializes_intermediates() {
        let mut store = Store::new();
        store.apply(&[Mutation::set(path("/x/y/z"), json!("deep"))]);
        assert_eq!(store.root(), &json!({"x": {"y": {"z": "deep"}}}));
    }

    #[test]
    fn test_set_through_scalar_replaces_it() {
        let mut store = Store::new();
        store.apply(&[Mutation::set(path("/a"), json!(1))]);
        store.apply(&[Mutation::set(path("/a/b"), json!(2))]);
        assert_eq!(store.root(), &json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_remove() {
        let mut store = Store::new();
        store.apply(&[
            Mutation::set(path("/a/b"), json!(1)),
            Mutation::set(path("/a/c"), json!(2)),
        ]);
        let applied = store.apply(&[Mutation::remove(path("/a/b"))]);
        assert_eq!(applied, vec![true]);
        assert_eq!(store.root(), &json!({"a": {"c": 2}}));

        // Removing an absent path still succeeds.
        let applied = store.apply(&[Mutation::remove(path("/nope"))]);
        assert_eq!(applied, vec![true]);
    }

    #[test]
    fn test_guard_is() {
        let mut store = Store::new();
        store.apply(&[Mutation::set(path("/n"), json!(1))]);

        let bump =
            Mutation::set(path("/n"), json!(2)).guarded(path("/n"), Guard::Is(json!(1)));
        assert_eq!(store.apply(&[bump.clone()]), vec![true]);
        // Same guard no longer holds; the store is untouched.
        assert_eq!(store.apply(&[bump]), vec![false]);
        assert_eq!(store.get(&path("/n")), Some(&json!(2)));
    }

    #[test]
    fn test_guard_exists() {
        let mut store = Store::new();
        let create = Mutation::set(path("/lock"), json!("me"))
            .guarded(path("/lock"), Guard::Exists(false));
        assert_eq!(store.apply(&[create.clone()]), vec![true]);
        assert_eq!(store.apply(&[create]), vec![false]);
    }

    #[test]
    fn test_failed_mutation_applies_no_writes() {
        let mut store = Store::new();
        let m = Mutation {
            writes: vec![
                (path("/a"), Op::Set(json!(1))),
                (path("/b"), Op::Set(json!(2))),
            ],
            guards: vec![(path("/missing"), Guard::Exists(true))],
        };
        assert_eq!(store.apply(&[m]), vec![false]);
        assert_eq!(store.root(), &json!({}));
    }

    #[test]
    fn test_read_view() {
        let mut store = Store::new();
        store.apply(&[Mutation::set(path("/a/b"), json!(7))]);
        let view = store.read(&[path("/a/b"), path("/a/nope"), path("/a/b/under")]);
        assert_eq!(view.success, vec![true, true, false]);
        assert_eq!(view.results, vec![json!(7), Value::Null, Value::Null]);
    }

    #[test]
    fn test_apply_is_deterministic() {
        let batch = vec![
            Mutation::set(path("/a"), json!({"k": 1})),
            Mutation::set(path("/a/k"), json!(2)).guarded(path("/a/k"), Guard::Is(json!(1))),
            Mutation::remove(path("/a/k")).guarded(path("/a/k"), Guard::Is(json!(999))),
            Mutation::set(path("/b"), json!([1, 2, 3])),
        ];
        let mut one = Store::new();
        let mut two = Store::new();
        assert_eq!(one.apply(&batch), two.apply(&batch));
        assert_eq!(one.root(), two.root());
    }

    #[test]
    fn test_prefix_then_suffix_equals_full_replay() {
        let log: Vec<Mutation> = (0..8)
            .map(|i| match i % 3 {
                0 => Mutation::set(path(&format!("/k{i}")), json!(i)),
                1 => Mutation::set(path("/shared"), json!(i))
                    .guarded(path(&format!("/k{}", i - 1)), Guard::Exists(true)),
                _ => Mutation::remove(path("/shared")),
            })
            .collect();

        for split in 0..=log.len() {
            let mut staged = Store::new();
            staged.apply(&log[..split]);
            staged.apply(&log[split..]);

            let mut direct = Store::new();
            direct.apply(&log);

            assert_eq!(staged.root(), direct.root(), "split at {split}");
        }
    }

    #[test]
    fn test_mutation_serde_roundtrip() {
        let m = Mutation::set(path("/cfg/limit"), json!(10))
            .guarded(path("/cfg"), Guard::Exists(true));
        let bytes = serde_json::to_vec(&m).unwrap();
        let back: Mutation = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, m);
    }
}
