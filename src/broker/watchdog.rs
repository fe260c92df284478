//! Session eviction watchdog.
//!
//! A watchdog with a configurable check interval scans `lastActivity`;
//! sessions older than `heartbeatInterval * N` are closed with their
//! outgoing queues drained (spec.md §4.C6). Grounded in the teacher's
//! `hub/lifecycle.rs` periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::sessions::Sessions;
use crate::broker::targets::Targets;

/// How many missed heartbeat intervals before a session is considered
/// dead. Multiplied by the configured heartbeat interval to get the
/// eviction threshold.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;

pub fn spawn_watchdog(
    sessions: Arc<Sessions>,
    targets: Arc<Targets>,
    check_interval: Duration,
    heartbeat_interval: Duration,
    missed_heartbeats_allowed: u32,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let threshold = heartbeat_interval * missed_heartbeats_allowed.max(1);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for peer_id in sessions.stale_peers(threshold) {
                        log::info!("[broker] evicting idle peer {peer_id} (idle > {threshold:?})");
                        sessions.remove(&peer_id);
                        targets.remove_owned_by(&peer_id);
                    }
                }
            }
        }
    })
}
