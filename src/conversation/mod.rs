//! Conversation/RPC engine (C8): request -> reply correlation, timers,
//! retry policy, cancellation.
//!
//! As spec.md §4.C8: a state machine per `conversationId`, `Start -> Sent ->
//! AwaitingReply -> (Completed | TimedOut | Failed | Cancelled)`. Keyed by a
//! `ConversationId` (`Uuid`, the teacher's existing dependency), each entry
//! pairing a `tokio::sync::oneshot::Sender` for the eventual reply with a
//! `tokio::time::Sleep`-backed timeout, matching the teacher's use of
//! `tokio::time::timeout` throughout its polling and device-auth loops.

pub mod timer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::{ErrorCode, ServerError, ServerErrorJson};
use crate::protocol::{BrokerProtocol, ConversationId, MessageId, MessageType, Payload};

pub use timer::RetryPolicy;

/// The terminal or in-flight state a conversation can report to its caller.
/// `Failed` carries the full `ServerErrorJson` — not just its message — so a
/// caller like C9's bridge can map it to an HTTP status without re-parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationOutcome {
    Completed(Payload),
    TimedOut,
    Failed(ServerErrorJson),
    Cancelled(String),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConversationState {
    Sent,
    AwaitingReply,
}

struct PendingConversation {
    state: ConversationState,
    message_id: MessageId,
    reply: Option<oneshot::Sender<ConversationOutcome>>,
}

/// A registry of in-flight conversations. One per forwarding backend /
/// bridge instance; `send` registers a waiter, `on_message` resolves it,
/// `cancel`/the timer task tear it down on the failure paths.
#[derive(Default)]
pub struct ConversationTable {
    inner: Mutex<HashMap<ConversationId, PendingConversation>>,
}

impl ConversationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new conversation and returns the receiver half the
    /// caller awaits. Idempotent for the same `messageId`: calling `send`
    /// twice with the same `messageId` for a conversation already
    /// `Sent`/`AwaitingReply` returns the existing waiter instead of
    /// re-registering it twice.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> oneshot::Receiver<ConversationOutcome> {
        let mut table = self.inner.lock().await;
        let (tx, rx) = oneshot::channel();

        match table.get_mut(&conversation_id) {
            Some(existing) if existing.message_id == message_id => {
                existing.reply = Some(tx);
            }
            _ => {
                table.insert(
                    conversation_id,
                    PendingConversation {
                        state: ConversationState::Sent,
                        message_id,
                        reply: Some(tx),
                    },
                );
            }
        }

        rx
    }

    /// Marks a registered conversation as having had its request flushed
    /// onto the wire; purely informational bookkeeping ahead of the reply.
    pub async fn mark_awaiting_reply(&self, conversation_id: ConversationId) {
        if let Some(entry) = self.inner.lock().await.get_mut(&conversation_id) {
            entry.state = ConversationState::AwaitingReply;
        }
    }

    /// Resolves a conversation from an inbound envelope. Returns `true` if
    /// `conversationId` matched an active conversation (and it was
    /// resolved); `false` means the caller should treat this as an
    /// unsolicited notification instead.
    pub async fn on_message(&self, envelope: &BrokerProtocol) -> bool {
        let mut table = self.inner.lock().await;
        let Some(mut entry) = table.remove(&envelope.conversation_id) else {
            return false;
        };

        let outcome = reply_outcome(envelope);

        if let Some(reply) = entry.reply.take() {
            let _ = reply.send(outcome);
        }
        true
    }

    /// Cancels an in-flight conversation; any pending reply is discarded
    /// and the waiter observes `Cancelled(reason)`.
    pub async fn cancel(&self, conversation_id: ConversationId, reason: impl Into<String>) {
        if let Some(mut entry) = self.inner.lock().await.remove(&conversation_id) {
            if let Some(reply) = entry.reply.take() {
                let _ = reply.send(ConversationOutcome::Cancelled(reason.into()));
            }
        }
    }

    /// Fires when the timer in `timer::spawn_timeout` expires without a
    /// reply having arrived; a conversation already resolved by `on_message`
    /// is simply absent from the table by then, so this is a no-op.
    pub async fn expire(&self, conversation_id: ConversationId) {
        if let Some(mut entry) = self.inner.lock().await.remove(&conversation_id) {
            if let Some(reply) = entry.reply.take() {
                let _ = reply.send(ConversationOutcome::TimedOut);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Resolves the reply envelope into the payload the caller sees:
/// `asyncRpcResponse.serverErrorJson` is a `Failed` reply, otherwise the
/// reply's payload — `asyncRpcResponse.result`, falling back to
/// `notificationData` for an unsolicited-looking reply — becomes `Completed`.
fn reply_outcome(envelope: &BrokerProtocol) -> ConversationOutcome {
    if let Some(response) = &envelope.async_rpc_response {
        if let Some(server_error_json) = &response.server_error_json {
            return ConversationOutcome::Failed(server_error_json.clone());
        }
        return ConversationOutcome::Completed(response.result.clone().unwrap_or(Payload::Null));
    }

    ConversationOutcome::Completed(
        envelope
            .notification_data
            .clone()
            .or_else(|| envelope.pass_through_user_data.clone())
            .unwrap_or(Payload::Null),
    )
}

/// Whether a failure is "expected transient" and should be retried, per
/// spec.md §4.C8: connection reset and target-queue-full retry, everything
/// else is terminal for the conversation.
pub fn is_retryable(err: &ServerError) -> bool {
    matches!(
        err,
        ServerError::ConnectionReset | ServerError::TargetPeerQueueFull { .. }
    )
}

/// Same classification as `is_retryable`, read off a reply's
/// `ServerErrorJson` instead of a locally-raised `ServerError`.
fn is_retryable_json(error: &ServerErrorJson) -> bool {
    let Some(code) = error
        .result
        .exception_properties
        .as_ref()
        .and_then(|p| p.error_code.as_deref())
    else {
        return false;
    };
    code == ErrorCode::ConnectionReset.as_str() || code == ErrorCode::TargetPeerQueueFull.as_str()
}

/// Drives one request through `send`, registration, timeout, and bounded
/// retry: a thin convenience wrapper so C7/C9 callers don't each re-derive
/// the retry loop.
pub async fn run_conversation<F, Fut>(
    table: &ConversationTable,
    conversation_id: ConversationId,
    message_id: MessageId,
    request_timeout: Duration,
    retry_policy: &RetryPolicy,
    mut dispatch: F,
) -> ConversationOutcome
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ServerError>>,
{
    let mut attempt = 0u32;
    loop {
        let rx = table.send(conversation_id, message_id).await;

        if let Err(err) = dispatch().await {
            let retryable = is_retryable(&err);
            let message = err.to_string();
            let error_json = err.to_server_error_json(message);
            table.cancel(conversation_id, err.to_string()).await;
            if retryable && attempt < retry_policy.max_retries {
                attempt += 1;
                tokio::time::sleep(retry_policy.backoff_for(attempt)).await;
                continue;
            }
            return ConversationOutcome::Failed(error_json);
        }

        table.mark_awaiting_reply(conversation_id).await;

        let timeout_guard = timer::spawn_timeout(table, conversation_id, request_timeout);
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => ConversationOutcome::TimedOut,
        };
        timeout_guard.abort();

        match outcome {
            ConversationOutcome::Failed(ref error_json) if attempt < retry_policy.max_retries => {
                // Only transient-looking reasons retry; a terminal server
                // error is returned to the caller as-is.
                if is_retryable_json(error_json) {
                    attempt += 1;
                    tokio::time::sleep(retry_policy.backoff_for(attempt)).await;
                    continue;
                }
                return outcome;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn on_message_resolves_a_registered_conversation() {
        let table = ConversationTable::new();
        let conversation_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let rx = table.send(conversation_id, message_id).await;

        let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcAcknowledgment, conversation_id);
        envelope.message_id = Uuid::new_v4();
        envelope.async_rpc_response = Some(crate::protocol::AsyncRpcResponse {
            server_error_json: None,
            result: Some(serde_json::json!({"hello": "world"})),
        });
        let resolved = table.on_message(&envelope).await;
        assert!(resolved);

        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome,
            ConversationOutcome::Completed(serde_json::json!({"hello": "world"}))
        );
    }

    #[tokio::test]
    async fn on_message_for_unknown_conversation_is_a_notification() {
        let table = ConversationTable::new();
        let envelope = BrokerProtocol::new(MessageType::AsyncRpcAcknowledgment, Uuid::new_v4());
        let resolved = table.on_message(&envelope).await;
        assert!(!resolved);
    }

    #[tokio::test]
    async fn cancel_discards_the_pending_reply() {
        let table = ConversationTable::new();
        let conversation_id = Uuid::new_v4();
        let rx = table.send(conversation_id, Uuid::new_v4()).await;

        table.cancel(conversation_id, "shutting down").await;
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, ConversationOutcome::Cancelled("shutting down".into()));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn expire_reports_timed_out_when_no_reply_arrives() {
        let table = ConversationTable::new();
        let conversation_id = Uuid::new_v4();
        let rx = table.send(conversation_id, Uuid::new_v4()).await;

        table.expire(conversation_id).await;
        assert_eq!(rx.await.unwrap(), ConversationOutcome::TimedOut);
    }

    #[tokio::test]
    async fn server_error_json_is_surfaced_as_failed() {
        let table = ConversationTable::new();
        let conversation_id = Uuid::new_v4();
        let rx = table.send(conversation_id, Uuid::new_v4()).await;

        let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcAcknowledgment, conversation_id);
        envelope.async_rpc_response = Some(crate::protocol::AsyncRpcResponse {
            server_error_json: Some(crate::error::ServerErrorJson {
                result: crate::error::ServerErrorResult {
                    message: "target peer queue full".into(),
                    exception_type: "X".into(),
                    exception_message: "X".into(),
                    exception_full_dump: "X".into(),
                    exception_properties: None,
                },
            }),
            result: None,
        });
        table.on_message(&envelope).await;

        match rx.await.unwrap() {
            ConversationOutcome::Failed(error_json) => {
                assert_eq!(error_json.result.message, "target peer queue full")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_conversation_completes_on_first_reply() {
        let table = ConversationTable::new();
        let conversation_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let retry_policy = RetryPolicy::default();

        let table_for_dispatch = table.clone();
        let outcome = tokio::join!(
            run_conversation(
                &table,
                conversation_id,
                message_id,
                Duration::from_secs(1),
                &retry_policy,
                || async { Ok(()) },
            ),
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcAcknowledgment, conversation_id);
                envelope.async_rpc_response = Some(crate::protocol::AsyncRpcResponse {
                    server_error_json: None,
                    result: Some(serde_json::json!({"ok": true})),
                });
                table_for_dispatch.on_message(&envelope).await;
            }
        )
        .0;

        assert_eq!(outcome, ConversationOutcome::Completed(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn run_conversation_times_out_without_a_reply() {
        let table = ConversationTable::new();
        let retry_policy = RetryPolicy { max_retries: 0, ..RetryPolicy::default() };

        let outcome = run_conversation(
            &table,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_millis(30),
            &retry_policy,
            || async { Ok(()) },
        )
        .await;

        assert_eq!(outcome, ConversationOutcome::TimedOut);
    }
}
