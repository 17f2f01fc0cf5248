//! The replicated log: an in-memory contiguous sequence over a durable
//! backend.
//!
//! The in-memory vector is the source of truth for reads; the backend is the
//! durability contract. An append returns only after the backend accepted
//! the records, so an index reported as confirmed by the local peer is
//! already on stable storage.
//!
//! The backend also keeps the constituent's `(current_term, voted_for)`
//! pair, which must hit disk before any vote response leaves the peer.

use crate::error::{AgencyError, Result};
use crate::types::{LogEntry, LogIndex, PeerId, Term};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// State recovered from a backend at startup.
#[derive(Debug, Default)]
pub struct LogRecovery {
    pub entries: Vec<LogEntry>,
    pub term: Term,
    pub voted_for: Option<PeerId>,
}

/// Durable substrate for the log and the vote state.
///
/// Implementations must be crash-consistent: once `append`, `truncate_from`
/// or `save_vote` returns `Ok`, a restart recovers that state.
pub trait LogBackend: Send {
    /// Recover persisted entries and vote state.
    fn load(&mut self) -> Result<LogRecovery>;

    /// Persist entries at the end of the log.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Drop all entries with index `>= index`.
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Persist the constituent's term and vote.
    fn save_vote(&mut self, term: Term, voted_for: Option<PeerId>) -> Result<()>;
}

/// Volatile backend for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Vec<LogEntry>,
    term: Term,
    voted_for: Option<PeerId>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogBackend for MemoryBackend {
    fn load(&mut self) -> Result<LogRecovery> {
        Ok(LogRecovery {
            entries: self.entries.clone(),
            term: self.term,
            voted_for: self.voted_for,
        })
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let keep = index.as_u64().saturating_sub(1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn save_vote(&mut self, term: Term, voted_for: Option<PeerId>) -> Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }
}

/// File-backed backend: length-prefixed bincode records in a single log
/// file, plus a small vote file replaced atomically.
///
/// Record format: `u32` little-endian length, then the bincode encoding of
/// one [`LogEntry`]. Recovery reads records until the first torn or
/// non-contiguous one and truncates the file there.
pub struct FileBackend {
    log_path: PathBuf,
    vote_path: PathBuf,
    file: Option<File>,
    /// Byte offset where the record for index `i + 1` starts.
    offsets: Vec<u64>,
}

impl FileBackend {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(persistence)?;
        Ok(Self {
            log_path: dir.join("agency.log"),
            vote_path: dir.join("vote"),
            file: None,
            offsets: Vec::new(),
        })
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.log_path)
                .map_err(persistence)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("just opened"))
    }

    fn load_vote(&self) -> (Term, Option<PeerId>) {
        let Ok(bytes) = std::fs::read(&self.vote_path) else {
            return (Term::ZERO, None);
        };
        match bincode::deserialize::<(Term, Option<PeerId>)>(&bytes) {
            Ok((term, voted_for)) => (term, voted_for),
            Err(err) => {
                tracing::warn!(error = %err, "unreadable vote file, starting at term 0");
                (Term::ZERO, None)
            }
        }
    }
}

impl LogBackend for FileBackend {
    fn load(&mut self) -> Result<LogRecovery> {
        let (term, voted_for) = self.load_vote();
        let file = self.file()?;
        let len = file.metadata().map_err(persistence)?.len();
        file.seek(SeekFrom::Start(0)).map_err(persistence)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = 0u64;
        while pos < len {
            let mut header = [0u8; 4];
            if pos + 4 > len || file.read_exact(&mut header).is_err() {
                break;
            }
            let record_len = u32::from_le_bytes(header) as u64;
            if pos + 4 + record_len > len {
                break;
            }
            let mut record = vec![0u8; record_len as usize];
            if file.read_exact(&mut record).is_err() {
                break;
            }
            let Ok(entry) = bincode::deserialize::<LogEntry>(&record) else {
                break;
            };
            if entry.index.as_u64() != entries.len() as u64 + 1 {
                break;
            }
            offsets.push(pos);
            entries.push(entry);
            pos += 4 + record_len;
        }

        if pos < len {
            tracing::warn!(
                recovered = entries.len(),
                dropped_bytes = len - pos,
                "torn tail in log file, truncating"
            );
            file.set_len(pos).map_err(persistence)?;
            file.sync_data().map_err(persistence)?;
        }

        self.offsets = offsets;
        Ok(LogRecovery {
            entries,
            term,
            voted_for,
        })
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut new_offsets = Vec::with_capacity(entries.len());
        let mut frame = Vec::new();
        let file = self.file()?;
        let mut pos = file.seek(SeekFrom::End(0)).map_err(persistence)?;
        for entry in entries {
            let record = bincode::serialize(entry)?;
            frame.clear();
            frame.extend_from_slice(&(record.len() as u32).to_le_bytes());
            frame.extend_from_slice(&record);
            file.write_all(&frame).map_err(persistence)?;
            new_offsets.push(pos);
            pos += frame.len() as u64;
        }
        file.sync_data().map_err(persistence)?;
        self.offsets.extend(new_offsets);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let keep = index.as_u64().saturating_sub(1) as usize;
        if keep >= self.offsets.len() {
            return Ok(());
        }
        let cut = self.offsets[keep];
        let file = self.file()?;
        file.set_len(cut).map_err(persistence)?;
        file.sync_data().map_err(persistence)?;
        self.offsets.truncate(keep);
        Ok(())
    }

    fn save_vote(&mut self, term: Term, voted_for: Option<PeerId>) -> Result<()> {
        let bytes = bincode::serialize(&(term, voted_for))?;
        let tmp = self.vote_path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(persistence)?;
        file.write_all(&bytes).map_err(persistence)?;
        file.sync_data().map_err(persistence)?;
        std::fs::rename(&tmp, &self.vote_path).map_err(persistence)?;
        Ok(())
    }
}

fn persistence(source: std::io::Error) -> AgencyError {
    AgencyError::Persistence { source }
}

/// The log store shared between the agent and the constituent.
///
/// The agent performs all writes (under its I/O lock); the constituent only
/// probes the last entry for election bookkeeping.
pub struct LogStore {
    entries: RwLock<Vec<LogEntry>>,
    backend: Mutex<Box<dyn LogBackend>>,
}

impl LogStore {
    /// Open over a backend, replaying its durable state.
    ///
    /// Returns the store plus the recovered `(term, voted_for)` pair for the
    /// constituent.
    pub fn open(mut backend: Box<dyn LogBackend>) -> Result<(Self, Term, Option<PeerId>)> {
        let recovery = backend.load()?;
        for (i, entry) in recovery.entries.iter().enumerate() {
            if entry.index.as_u64() != i as u64 + 1 {
                return Err(AgencyError::Internal {
                    reason: format!("recovered log has a gap at {}", entry.index),
                });
            }
        }
        Ok((
            Self {
                entries: RwLock::new(recovery.entries),
                backend: Mutex::new(backend),
            },
            recovery.term,
            recovery.voted_for,
        ))
    }

    /// Append pre-indexed entries (follower ingest path).
    ///
    /// Durable before returning. The batch must continue the log without a
    /// gap.
    pub fn append(&self, batch: Vec<LogEntry>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let mut expected = entries.len() as u64 + 1;
        for entry in &batch {
            if entry.index.as_u64() != expected {
                return Err(AgencyError::Internal {
                    reason: format!(
                        "append of {} would leave a gap after I{}",
                        entry.index,
                        expected - 1
                    ),
                });
            }
            expected += 1;
        }
        self.backend.lock().append(&batch)?;
        entries.extend(batch);
        Ok(())
    }

    /// Assign the next indices to `payloads` and append (leader write path).
    pub fn append_payloads(&self, payloads: Vec<Bytes>, term: Term) -> Result<Vec<LogIndex>> {
        let mut entries = self.entries.write();
        let mut next = entries.len() as u64 + 1;
        let mut batch = Vec::with_capacity(payloads.len());
        let mut indices = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let index = LogIndex(next);
            next += 1;
            indices.push(index);
            batch.push(LogEntry::new(index, term, payload));
        }
        self.backend.lock().append(&batch)?;
        entries.extend(batch);
        Ok(indices)
    }

    /// Drop all entries with index `>= index` (conflict resolution only).
    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut entries = self.entries.write();
        let keep = index.as_u64().saturating_sub(1) as usize;
        if keep >= entries.len() {
            return Ok(());
        }
        self.backend.lock().truncate_from(index)?;
        entries.truncate(keep);
        Ok(())
    }

    /// Entries in `[from, to]`; `to = None` means through the end.
    pub fn slice(&self, from: LogIndex, to: Option<LogIndex>) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let start = from.as_u64().saturating_sub(1) as usize;
        let end = match to {
            Some(to) => (to.as_u64() as usize).min(entries.len()),
            None => entries.len(),
        };
        if start >= end {
            return Vec::new();
        }
        entries[start..end].to_vec()
    }

    /// The replication probe: all entries after `index`, with the entry at
    /// `index` supplying `(prev_log_index, prev_log_term)`.
    ///
    /// `index = 0` yields the zero sentinels and the whole log.
    pub fn entries_from(&self, index: LogIndex) -> (LogIndex, Term, Vec<LogEntry>) {
        let entries = self.entries.read();
        let from = (index.as_u64() as usize).min(entries.len());
        let (prev_index, prev_term) = if from == 0 {
            (LogIndex::ZERO, Term::ZERO)
        } else {
            let prev = &entries[from - 1];
            (prev.index, prev.term)
        };
        (prev_index, prev_term, entries[from..].to_vec())
    }

    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        let entries = self.entries.read();
        let slot = index.as_u64().checked_sub(1)? as usize;
        entries.get(slot).cloned()
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        let entries = self.entries.read();
        let slot = index.as_u64().checked_sub(1)? as usize;
        entries.get(slot).map(|e| e.term)
    }

    /// `(index, term)` of the last entry, if any.
    pub fn last(&self) -> Option<(LogIndex, Term)> {
        let entries = self.entries.read();
        entries.last().map(|e| (e.index, e.term))
    }

    pub fn last_index(&self) -> LogIndex {
        self.last().map(|(i, _)| i).unwrap_or(LogIndex::ZERO)
    }

    /// Persist the constituent's term and vote. Must complete before any
    /// vote response leaves this peer.
    pub fn save_vote(&self, term: Term, voted_for: Option<PeerId>) -> Result<()> {
        self.backend.lock().save_vote(term, voted_for)
    }
}
