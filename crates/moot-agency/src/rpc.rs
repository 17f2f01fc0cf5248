//! Dispatch loop bridging transport envelopes to the agent's handlers.
//!
//! Protocol-level rejections travel as typed errors out of the agent and
//! are flattened to wire responses here: a stale term answers with our
//! term, a log mismatch with `success = false`. Anything else (a failed
//! durable write, a shutdown) drops the reply and lets the sender time out.

use crate::agent::Agent;
use crate::error::AgencyError;
use crate::transport::{RpcMessage, RpcReceiver};
use crate::types::AppendEntriesResponse;
use std::sync::Arc;
use tokio::sync::broadcast;

pub(crate) async fn rpc_loop(
    agent: Arc<Agent>,
    mut rpc_rx: RpcReceiver,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = rpc_rx.recv() => {
                match message {
                    Some(message) => dispatch(&agent, message),
                    None => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("rpc dispatcher stopped");
}

fn dispatch(agent: &Arc<Agent>, message: RpcMessage) {
    match message {
        RpcMessage::RequestVote { request, reply } => match agent.request_vote(request) {
            Ok(response) => {
                let _ = reply.send(response);
            }
            Err(err) => {
                tracing::error!(error = %err, "vote handling failed, dropping reply");
            }
        },
        RpcMessage::AppendEntries { request, reply } => {
            let response = match agent.recv_append_entries(request) {
                Ok(response) => response,
                Err(AgencyError::StaleTerm { current, .. }) => AppendEntriesResponse {
                    term: current,
                    success: false,
                },
                Err(AgencyError::LogMismatch { .. }) => AppendEntriesResponse {
                    term: agent.term(),
                    success: false,
                },
                Err(err) => {
                    tracing::error!(error = %err, "append handling failed, dropping reply");
                    return;
                }
            };
            let _ = reply.send(response);
        }
    }
}
