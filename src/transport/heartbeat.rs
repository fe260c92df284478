//! Idle-driven heartbeat task (C3's `startHeartbeat`).
//!
//! A `tokio::time::interval`-driven task matching the teacher's
//! `hub/polling.rs` periodic-tick pattern: sends a `ReceiveChunk` frame with
//! a nil chunk id whenever the write side has been idle for `interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::codes::CommandByte;
use crate::transport::framing::FrameHeader;

/// Shared "last write" clock, updated by the write path every time a real
/// (non-heartbeat) frame goes out.
#[derive(Debug)]
pub struct IdleClock {
    epoch: Instant,
    last_write_millis: AtomicU64,
}

impl IdleClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_write_millis: AtomicU64::new(0),
        })
    }

    pub fn mark_write(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_write_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_write_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

impl Default for IdleClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            last_write_millis: AtomicU64::new(0),
        }
    }
}

/// Spawns the heartbeat task. It pushes a heartbeat frame onto `outgoing`
/// (the connection's outgoing write channel) whenever the idle clock shows
/// no real write within `interval`; stops when `shutdown` is cancelled or
/// `outgoing` is closed.
pub fn start_heartbeat(
    interval: Duration,
    idle: Arc<IdleClock>,
    peer_id: Uuid,
    outgoing: mpsc::Sender<(FrameHeader, Vec<u8>)>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if idle.idle_for() < interval {
                        continue;
                    }
                    let header = FrameHeader::new(CommandByte::ReceiveChunk, Uuid::nil(), peer_id, Uuid::nil());
                    if outgoing.send((header, Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
