//! Bounded reply timers and the retry backoff curve shared with C7.
//!
//! Matches the teacher's use of `tokio::time::timeout` throughout its
//! polling and device-auth loops: rather than wrapping the whole await in
//! `tokio::time::timeout` (which would race the reply channel itself), the
//! timer here is a dedicated task that calls back into the conversation
//! table on expiry, matching spec.md §5's "timeouts are dedicated timer
//! tasks whose firing calls cancel".

use std::time::Duration;

use rand::Rng;

use crate::conversation::ConversationTable;
use crate::protocol::ConversationId;

/// Spawns a timer that calls `ConversationTable::expire` after `timeout`
/// unless aborted first. The caller aborts it as soon as the reply arrives
/// through the normal `on_message` path.
pub fn spawn_timeout(
    table: &std::sync::Arc<ConversationTable>,
    conversation_id: ConversationId,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let table = table.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        table.expire(conversation_id).await;
    })
}

/// Retry backoff for transient conversation failures: same curve C7 uses
/// for forwarding-backend reconnects (100 ms base, doubling, capped at
/// 5 s, +-25% jitter), so a retried RPC and a reconnecting stripe back off
/// on a consistent schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// The delay before retry attempt number `attempt` (1-indexed),
    /// jittered +-25% the same way `forwarding::reconnect::Backoff` is.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let scaled = self.base_delay.saturating_mul(1u32 << exponent);
        let capped_millis = scaled.min(self.max_delay).as_millis() as i64;

        let jitter_range = (capped_millis as f64 * 0.25) as i64;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis((capped_millis + jitter).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_delay_with_jitter() {
        let policy = RetryPolicy::default();
        for attempt in 1..=20 {
            let delay = policy.backoff_for(attempt);
            assert!(delay <= policy.max_delay.mul_f64(1.25));
        }
    }

    #[tokio::test]
    async fn timeout_fires_expire_when_not_aborted() {
        let table = ConversationTable::new();
        let conversation_id = uuid::Uuid::new_v4();
        let rx = table.send(conversation_id, uuid::Uuid::new_v4()).await;

        let _handle = spawn_timeout(&table, conversation_id, Duration::from_millis(20));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, crate::conversation::ConversationOutcome::TimedOut);
    }
}
