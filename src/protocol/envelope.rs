//! The `BrokerProtocol` JSON envelope and its nested payload models.
//!
//! Field names and nesting are pinned down from
//! `original_source/.../baselib/data/models/JsonMessaging.h`: this is the
//! JSON payload carried inside every frame (§3 of spec.md), never the wire
//! header. Unknown JSON fields on every model here are preserved via
//! `#[serde(flatten)]` into an `extra` map, mirroring baselib's "unmapped
//! fields survive round-trip" data-model behavior.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServerErrorJson;

pub type PeerId = Uuid;
pub type ChunkId = Uuid;
pub type MessageId = Uuid;
pub type ConversationId = Uuid;

/// `MessageType` enum in `JsonMessaging.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    AsyncRpcDispatch,
    AsyncRpcAcknowledgment,
    AsyncNotification,
    BackendAssociateTargetPeerId,
    BackendDissociateTargetPeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationToken {
    #[serde(rename = "type")]
    pub token_type: String,
    pub data: String,
}

/// Field names follow spec.md §3's `{secureIdentity, givenName, familyName,
/// email, typeId, authenticationToken}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPrincipal {
    #[serde(rename = "secureIdentity")]
    pub sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalIdentityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<AuthenticationToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_principal: Option<SecurityPrincipal>,
}

/// Opaque JSON value used for `passThroughUserData`, `asyncRpcRequest`, and
/// `notificationData` — all typedef'd to `bl::dm::Payload` in the original.
pub type Payload = serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncRpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_error_json: Option<ServerErrorJson>,
    /// The successful reply body, echoed back under the same slot the
    /// request travelled in. Absent when `server_error_json` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
}

/// The broker envelope, carried as the frame payload (never the header).
/// `async_rpc_request`/`async_rpc_response`/`notification_data` carry at
/// most one of the three by convention (matching the original's loose
/// "all optional" data model) rather than an enum, so unknown combinations
/// still deserialize instead of failing closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProtocol {
    pub message_type: MessageType,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_identity_info: Option<PrincipalIdentityInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_user_data: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_request: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_response: Option<AsyncRpcResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_data: Option<Payload>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BrokerProtocol {
    /// Builds a fresh envelope for a new conversation, the shape C9's
    /// bridge and C8's conversation engine both start from.
    pub fn new(message_type: MessageType, conversation_id: ConversationId) -> Self {
        Self {
            message_type,
            message_id: Uuid::new_v4(),
            conversation_id,
            source_peer_id: None,
            target_peer_id: None,
            principal_identity_info: None,
            pass_through_user_data: None,
            async_rpc_request: None,
            async_rpc_response: None,
            notification_data: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A heartbeat is conventionally an `AsyncNotification` with no
    /// payload and a nil chunk id; it never touches the target association
    /// table (spec.md §3 invariant 6).
    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MessageType::AsyncNotification
            && self.pass_through_user_data.is_none()
            && self.target_peer_id.is_none()
    }

    /// Builds the `AsyncRpcAcknowledgment` that answers this envelope on
    /// success, addressed back to whoever sent it, carrying `result` in the
    /// same `asyncRpcResponse` slot the original request travelled in.
    pub fn acknowledge(&self, from: PeerId, result: Payload) -> Self {
        Self {
            message_type: MessageType::AsyncRpcAcknowledgment,
            message_id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            source_peer_id: Some(from),
            target_peer_id: self.source_peer_id,
            principal_identity_info: None,
            pass_through_user_data: None,
            async_rpc_request: None,
            async_rpc_response: Some(AsyncRpcResponse {
                server_error_json: None,
                result: Some(result),
            }),
            notification_data: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Builds the `AsyncRpcAcknowledgment` that answers this envelope with a
    /// failure, per spec.md §4.C6: `serverErrorJson` in `asyncRpcResponse`.
    pub fn acknowledge_error(&self, from: PeerId, error: crate::error::ServerErrorJson) -> Self {
        Self {
            message_type: MessageType::AsyncRpcAcknowledgment,
            message_id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            source_peer_id: Some(from),
            target_peer_id: self.source_peer_id,
            principal_identity_info: None,
            pass_through_user_data: None,
            async_rpc_request: None,
            async_rpc_response: Some(AsyncRpcResponse {
                server_error_json: Some(error),
                result: None,
            }),
            notification_data: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let original = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
        let json = serde_json::to_string(&original).unwrap();
        let parsed: BrokerProtocol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_id, original.message_id);
        assert_eq!(parsed.conversation_id, original.conversation_id);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = serde_json::json!({
            "messageType": "AsyncNotification",
            "messageId": Uuid::new_v4().to_string(),
            "conversationId": Uuid::new_v4().to_string(),
            "somethingNew": 42,
        });
        let parsed: BrokerProtocol = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.extra.get("somethingNew").unwrap(), 42);

        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["somethingNew"], 42);
    }

    #[test]
    fn heartbeat_has_no_target_and_no_payload() {
        let mut envelope = BrokerProtocol::new(MessageType::AsyncNotification, Uuid::new_v4());
        assert!(envelope.is_heartbeat());
        envelope.target_peer_id = Some(Uuid::new_v4());
        assert!(!envelope.is_heartbeat());
    }
}
