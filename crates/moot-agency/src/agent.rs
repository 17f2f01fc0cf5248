//! The agent: per-peer orchestrator of the agency.
//!
//! The agent owns the confirmation vector, the commit index, both store
//! views and all log writes; the constituent owns term and vote; the log
//! store is shared read-only between them. Data flows leader-side as:
//! client write → leadership check → apply to spearhead → append to log →
//! replication driver ships batches → followers confirm → commit index
//! advances on quorum → committed prefix applies to the read store →
//! waiters wake.
//!
//! # Locking
//!
//! `io` (a mutex) serializes writes, confirmations and commit advancement.
//! It is held for the whole of `write` and of a confirmation-driven commit,
//! and is always acquired before any waiter or driver signal fires. The
//! store locks and the log's internal locks are leaves.

use crate::config::AgencyConfig;
use crate::constituent::{election_loop, Constituent, LeadershipHook};
use crate::error::{AgencyError, Result};
use crate::log::{LogBackend, LogStore};
use crate::replication::replication_loop;
use crate::rpc::rpc_loop;
use crate::transport::{RpcReceiver, Transport};
use crate::types::*;
use crate::waiter::WaiterRegistry;
use bytes::Bytes;
use moot_store::{Mutation, Path, ReadView, Store};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Replication bookkeeping, guarded by the agent's I/O lock.
struct IoState {
    /// `confirmed[p]` is the highest index peer `p` is known to have stored.
    /// Our own slot advances on local append; follower slots advance through
    /// [`Agent::report_in`] and double as the replication cursor.
    confirmed: Vec<LogIndex>,

    /// Highest index known stored on a strict majority. Never retreats.
    commit_index: LogIndex,
}

/// One peer of the agency.
///
/// Created with a static configuration over a durable log backend, then
/// started; runs until [`Agent::shutdown`].
pub struct Agent {
    config: AgencyConfig,
    endpoints: RwLock<Vec<String>>,
    log: Arc<LogStore>,
    constituent: Arc<Constituent>,
    transport: Arc<dyn Transport>,
    io: Mutex<IoState>,
    /// The leader's optimistic view: the full local log.
    spearhead: RwLock<Store>,
    /// The committed view: exactly the prefix `[1..commit_index]`.
    read_db: RwLock<Store>,
    waiters: WaiterRegistry,
    /// Wakes the replication driver on local writes and on lead.
    wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    rpc_rx: Mutex<Option<RpcReceiver>>,
}

impl Agent {
    /// Build an agent over a durable backend, replaying its log.
    ///
    /// The spearhead is reassembled from the full durable log. The read
    /// store starts empty: commit evidence is not persisted, so the
    /// committed view catches up with the first commit advancement.
    pub fn new(
        config: AgencyConfig,
        backend: Box<dyn LogBackend>,
        transport: Arc<dyn Transport>,
        rpc_rx: Option<RpcReceiver>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|reason| AgencyError::Config { reason })?;

        let (log, term, voted_for) = LogStore::open(backend)?;
        let log = Arc::new(log);
        tracing::info!(
            id = %config.id,
            term = %term,
            last = %log.last_index(),
            "loaded persistent state"
        );

        let constituent = Arc::new(Constituent::new(config.clone(), log.clone(), term, voted_for));
        let cluster_size = config.cluster_size();
        let agent = Arc::new(Self {
            endpoints: RwLock::new(config.endpoints.clone()),
            config,
            log,
            constituent,
            transport,
            io: Mutex::new(IoState {
                confirmed: vec![LogIndex::ZERO; cluster_size],
                commit_index: LogIndex::ZERO,
            }),
            spearhead: RwLock::new(Store::new()),
            read_db: RwLock::new(Store::new()),
            waiters: WaiterRegistry::new(),
            wake: Notify::new(),
            shutdown_tx: broadcast::channel(16).0,
            stopped: AtomicBool::new(false),
            rpc_rx: Mutex::new(rpc_rx),
        });

        let replayed = agent.decode_range(LogIndex(1), None)?;
        agent.spearhead.write().apply(&replayed);

        Ok(agent)
    }

    /// Spawn the background tasks: election loop, replication driver and
    /// (when an RPC receiver was supplied) the dispatch loop.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let hook: Weak<dyn LeadershipHook> = Arc::downgrade(&(self.clone() as Arc<dyn LeadershipHook>));
        tokio::spawn(election_loop(
            self.constituent.clone(),
            self.transport.clone(),
            hook,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(replication_loop(self.clone(), self.shutdown_tx.subscribe()));
        if let Some(rpc_rx) = self.rpc_rx.lock().take() {
            tokio::spawn(rpc_loop(self.clone(), rpc_rx, self.shutdown_tx.subscribe()));
        }
    }

    /// Stop the loops and wake every waiter with a failure outcome.
    /// In-flight replication callbacks no-op from here on.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(id = %self.config.id, "agent shutting down");
        self.waiters.shutdown();
        let _ = self.shutdown_tx.send(());
        self.wake.notify_waiters();
    }

    pub fn id(&self) -> PeerId {
        self.config.id
    }

    pub fn config(&self) -> &AgencyConfig {
        &self.config
    }

    pub fn term(&self) -> Term {
        self.constituent.term()
    }

    pub fn leading(&self) -> bool {
        self.constituent.leading()
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.constituent.leader_id()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.io.lock().commit_index
    }

    /// `(index, term)` of the last log entry, if any.
    pub fn last_log(&self) -> Option<(LogIndex, Term)> {
        self.log.last()
    }

    /// Current endpoint table (refreshed by vote-body gossip).
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }

    /// Snapshot of the committed view, for diagnostics and tests.
    pub fn read_store(&self) -> Store {
        self.read_db.read().clone()
    }

    /// Snapshot of the optimistic view, for diagnostics and tests.
    pub fn spearhead(&self) -> Store {
        self.spearhead.read().clone()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) async fn write_signal(&self) {
        self.wake.notified().await;
    }

    /// Accept a batch of mutations, if we lead.
    ///
    /// Every payload gets a log index, whether or not its guards held
    /// against the spearhead, so the client observes a definite per-entry
    /// outcome. Entries are durable locally before this returns; callers
    /// pass an index to [`Agent::wait_for`] to learn when it commits.
    pub fn write(&self, queries: &[Mutation]) -> Result<WriteAck> {
        if self.stopped() {
            return Err(AgencyError::Shutdown);
        }
        if !self.constituent.leading() {
            return Err(AgencyError::NotLeader {
                leader: self.constituent.leader_id(),
            });
        }
        let term = self.constituent.term();
        let mut payloads = Vec::with_capacity(queries.len());
        for query in queries {
            payloads.push(Bytes::from(serde_json::to_vec(query)?));
        }

        let mut io = self.io.lock();
        let applied = self.spearhead.write().apply(queries);
        let indices = self
            .log
            .append_payloads(payloads, term)
            .map_err(|err| self.fatal(err))?;
        if let Some(&last) = indices.last() {
            io.confirmed[self.config.id.as_usize()] = last;
            self.advance_commit(&mut io, last)?;
            tracing::debug!(count = indices.len(), through = %last, "accepted write");
        }
        drop(io);
        self.wake.notify_one();

        Ok(WriteAck {
            leader: self.config.id,
            applied,
            indices,
        })
    }

    /// Evaluate read queries, if we lead.
    ///
    /// Served from the committed view; a single-peer agency has no
    /// replication lag and reads its spearhead instead.
    pub fn read(&self, queries: &[Path]) -> Result<ReadView> {
        if !self.constituent.leading() {
            return Err(AgencyError::NotLeader {
                leader: self.constituent.leader_id(),
            });
        }
        let view = if self.config.cluster_size() == 1 {
            self.spearhead.read().read(queries)
        } else {
            self.read_db.read().read(queries)
        };
        Ok(view)
    }

    /// Block until `index` commits.
    ///
    /// `true` once `commit_index >= index`; `false` on timeout or shutdown.
    /// A single-peer agency commits at write time, so this is immediate.
    pub async fn wait_for(&self, index: LogIndex, timeout: Duration) -> bool {
        if self.config.cluster_size() == 1 {
            return true;
        }
        self.waiters.wait_for(index, timeout).await
    }

    /// Follower ingest of a replication batch (or heartbeat).
    ///
    /// Rejects stale terms and unmatched `prev` coordinates; otherwise
    /// drops any conflicting suffix, appends the batch, and advances the
    /// commit index to `min(leader_commit, last_index)`, applying the newly
    /// committed range to the read store.
    pub fn recv_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.stopped() {
            return Err(AgencyError::Shutdown);
        }
        self.constituent
            .note_leader(request.term, request.leader_id)?;

        let mut io = self.io.lock();
        if request.prev_log_index != LogIndex::ZERO {
            match self.log.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                _ => {
                    tracing::warn!(
                        prev_index = %request.prev_log_index,
                        prev_term = %request.prev_log_term,
                        ours = %self.log.last_index(),
                        "log mismatch, rejecting batch"
                    );
                    return Err(AgencyError::LogMismatch {
                        prev_log_index: request.prev_log_index,
                        prev_log_term: request.prev_log_term,
                    });
                }
            }
        }

        if !request.entries.is_empty() {
            // Skip entries we already hold with the same term; a delayed
            // duplicate must not throw away durable entries. Truncation
            // starts at the first real conflict.
            let mut batch = request.entries;
            let mut already_held = 0;
            for entry in &batch {
                match self.log.term_at(entry.index) {
                    Some(term) if term == entry.term => already_held += 1,
                    Some(_) => {
                        self.log
                            .truncate_from(entry.index)
                            .map_err(|err| self.fatal(err))?;
                        break;
                    }
                    None => break,
                }
            }
            let batch = batch.split_off(already_held);
            if !batch.is_empty() {
                tracing::debug!(
                    count = batch.len(),
                    from = %batch[0].index,
                    "appending replicated entries"
                );
                self.log.append(batch).map_err(|err| self.fatal(err))?;
            }
        }

        let new_commit = request.leader_commit.min(self.log.last_index());
        if new_commit > io.commit_index {
            self.apply_committed(&mut io, new_commit)?;
        }

        Ok(AppendEntriesResponse {
            term: self.constituent.term(),
            success: true,
        })
    }

    /// Handle a vote solicitation: merge gossiped endpoints, then let the
    /// constituent rule on the ballot.
    pub fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        if self.stopped() {
            return Err(AgencyError::Shutdown);
        }
        if let Some(gossip) = &request.endpoints {
            let mut endpoints = self.endpoints.write();
            for (slot, endpoint) in gossip.iter().enumerate() {
                if slot < endpoints.len() && !endpoint.is_empty() {
                    endpoints[slot] = endpoint.clone();
                }
            }
        }
        self.constituent.vote(&request)
    }

    /// Replication callback: `follower` has stored everything up to `index`.
    ///
    /// Raises the follower's confirmation slot and advances the commit
    /// index when `index` reaches a strict majority.
    pub fn report_in(&self, follower: PeerId, index: LogIndex) -> Result<()> {
        if self.stopped() {
            return Ok(());
        }
        let mut io = self.io.lock();
        let slot = follower.as_usize();
        if slot >= io.confirmed.len() {
            return Err(AgencyError::Internal {
                reason: format!("confirmation from unknown peer {follower}"),
            });
        }
        if index > io.confirmed[slot] {
            io.confirmed[slot] = index;
        }
        self.advance_commit(&mut io, index)
    }

    /// Back the replication cursor off after a log mismatch; the next tick
    /// retries from one entry earlier.
    pub(crate) fn retreat(&self, follower: PeerId) {
        let mut io = self.io.lock();
        let slot = follower.as_usize();
        if let Some(previous) = io.confirmed[slot].prev() {
            io.confirmed[slot] = previous;
        }
    }

    /// Leader-side dispatch of one replication batch to `follower`.
    ///
    /// Reads the follower's cursor, frames everything after it (the entry
    /// at the cursor supplies the `prev` coordinates; an empty batch is a
    /// heartbeat) and ships it asynchronously. The response callback
    /// confirms progress, backs off on mismatch, or steps the leader down
    /// on a higher term; transport failures are dropped and retried on the
    /// next tick.
    pub(crate) fn send_append_entries(self: &Arc<Self>, follower: PeerId) {
        let (cursor, leader_commit) = {
            let io = self.io.lock();
            (io.confirmed[follower.as_usize()], io.commit_index)
        };
        let (prev_log_index, prev_log_term, entries) = self.log.entries_from(cursor);
        let term = self.constituent.term();
        let last = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        if !entries.is_empty() {
            tracing::debug!(
                follower = %follower,
                count = entries.len(),
                through = %last,
                "shipping entries"
            );
        }
        let request = AppendEntriesRequest {
            term,
            leader_id: self.config.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        let agent = self.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            match transport.append_entries(follower, request).await {
                Ok(response) => {
                    if agent.stopped() {
                        return;
                    }
                    if response.term > term {
                        let _ = agent.constituent.observe_term(response.term);
                    } else if response.success {
                        if let Err(err) = agent.report_in(follower, last) {
                            tracing::error!(error = %err, "confirmation processing failed");
                        }
                    } else {
                        agent.retreat(follower);
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        follower = %follower,
                        error = %err,
                        "append-entries send failed, retrying next tick"
                    );
                }
            }
        });
    }

    /// Advance the commit index to `index` if a strict majority confirmed
    /// it and the entry there was created in the current term (earlier
    /// entries ride along in the applied prefix).
    fn advance_commit(&self, io: &mut IoState, index: LogIndex) -> Result<()> {
        if index <= io.commit_index {
            return Ok(());
        }
        let confirmations = io.confirmed.iter().filter(|&&c| c >= index).count();
        if confirmations < self.config.quorum() {
            return Ok(());
        }
        if self.log.term_at(index) != Some(self.constituent.term()) {
            return Ok(());
        }
        self.apply_committed(io, index)
    }

    /// Apply `(commit_index, upto]` to the read store, in index order, then
    /// publish the new commit index to the waiters.
    fn apply_committed(&self, io: &mut IoState, upto: LogIndex) -> Result<()> {
        let from = io.commit_index.next();
        let batch = self.decode_range(from, Some(upto))?;
        self.read_db.write().apply(&batch);
        io.commit_index = upto;
        self.waiters.advance(upto);
        tracing::info!(from = %from, through = %upto, "advanced commit index");
        Ok(())
    }

    /// A failed durable write takes the whole agent down: a log that can no
    /// longer persist cannot honor any confirmation it reports.
    fn fatal(&self, err: AgencyError) -> AgencyError {
        if matches!(err, AgencyError::Persistence { .. }) {
            tracing::error!(error = %err, "durable log write failed, shutting down");
            self.shutdown();
        }
        err
    }

    fn decode_range(&self, from: LogIndex, to: Option<LogIndex>) -> Result<Vec<Mutation>> {
        let entries = self.log.slice(from, to);
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            batch.push(serde_json::from_slice(&entry.payload)?);
        }
        Ok(batch)
    }
}

impl LeadershipHook for Agent {
    /// Reassemble both views from the log before the new role is visible:
    /// the spearhead replays the full local log, the read store the
    /// committed prefix.
    fn rebuild_for_lead(&self) {
        let io = self.io.lock();
        let full = match self.decode_range(LogIndex(1), None) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, "cannot decode log for store rebuild");
                return;
            }
        };
        let committed = (io.commit_index.as_u64() as usize).min(full.len());

        let mut spearhead = Store::new();
        spearhead.apply(&full);
        let mut read_db = Store::new();
        read_db.apply(&full[..committed]);

        *self.spearhead.write() = spearhead;
        *self.read_db.write() = read_db;
        tracing::info!(
            through = %self.log.last_index(),
            committed = %io.commit_index,
            "rebuilt stores for leadership"
        );
    }

    fn lead_acquired(&self) {
        self.wake.notify_one();
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }
}
