//! Transport abstraction for agency RPCs.
//!
//! The production transport (HTTP over the cluster network) lives outside
//! this crate; the core only needs an asynchronous request sender. The
//! [`InMemoryTransport`] wires agents together through channels so whole
//! clusters run in one process for tests.

use crate::error::{AgencyError, Result};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Asynchronous request sender used by elections and replication.
///
/// Implementations own connection management, serialization and retries.
/// A returned error means the request was dropped; callers retry on their
/// own schedule (the next replication tick, the next election).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Solicit a vote from `target`.
    async fn request_vote(
        &self,
        target: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Ship a batch of entries (or a heartbeat) to `target`.
    async fn append_entries(
        &self,
        target: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Envelope for one incoming RPC plus its reply channel.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        reply: tokio::sync::oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: tokio::sync::oneshot::Sender<AppendEntriesResponse>,
    },
}

pub type RpcSender = tokio::sync::mpsc::Sender<RpcMessage>;
pub type RpcReceiver = tokio::sync::mpsc::Receiver<RpcMessage>;

/// Channel-backed transport for in-process clusters.
///
/// Removing a peer simulates a partition: sends to it fail like a dead
/// connection until it is added back.
pub struct InMemoryTransport {
    peers: Arc<RwLock<HashMap<PeerId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(peers: HashMap<PeerId, RpcSender>) -> Self {
        Self {
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn add_peer(&self, peer: PeerId, sender: RpcSender) {
        self.peers.write().insert(peer, sender);
    }

    pub fn remove_peer(&self, peer: PeerId) {
        self.peers.write().remove(&peer);
    }

    fn peer(&self, peer: PeerId) -> Result<RpcSender> {
        self.peers.read().get(&peer).cloned().ok_or_else(|| unreachable_peer(peer))
    }
}

fn unreachable_peer(peer: PeerId) -> AgencyError {
    AgencyError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("peer unreachable: {peer}"),
        ),
    }
}

fn dropped_reply(peer: PeerId) -> AgencyError {
    AgencyError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("no reply from {peer}"),
        ),
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let sender = self.peer(target)?;
        let (reply, response) = tokio::sync::oneshot::channel();
        sender
            .send(RpcMessage::RequestVote { request, reply })
            .await
            .map_err(|_| unreachable_peer(target))?;
        response.await.map_err(|_| dropped_reply(target))
    }

    async fn append_entries(
        &self,
        target: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let sender = self.peer(target)?;
        let (reply, response) = tokio::sync::oneshot::channel();
        sender
            .send(RpcMessage::AppendEntries { request, reply })
            .await
            .map_err(|_| unreachable_peer(target))?;
        response.await.map_err(|_| dropped_reply(target))
    }
}
