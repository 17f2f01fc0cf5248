//! The replication driver.
//!
//! One task per agent. While leading it wakes every heartbeat interval, or
//! earlier when a local write signals, and dispatches one batch to every
//! other peer; catch-up traffic and heartbeats are the same mechanism, an
//! empty batch being a heartbeat. While following it parks until signaled
//! (a won election signals through the same notifier).

use crate::agent::Agent;
use std::sync::Arc;
use tokio::sync::broadcast;

pub(crate) async fn replication_loop(agent: Arc<Agent>, mut shutdown: broadcast::Receiver<()>) {
    let heartbeat = agent.config().heartbeat_interval;
    loop {
        if agent.leading() {
            tokio::select! {
                _ = agent.write_signal() => {}
                _ = tokio::time::sleep(heartbeat) => {}
                _ = shutdown.recv() => break,
            }
        } else {
            tokio::select! {
                _ = agent.write_signal() => {}
                _ = shutdown.recv() => break,
            }
        }

        if !agent.leading() {
            continue;
        }
        for peer in agent.config().others() {
            agent.send_append_entries(peer);
        }
    }
    tracing::debug!("replication driver stopped");
}
