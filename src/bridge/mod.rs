//! HTTP -> messaging bridge (C9): turns an inbound HTTPS request into an
//! `AsyncRpcDispatch` conversation against a configured server peer and maps
//! the eventual reply back onto an HTTP response.
//!
//! Grounded in the teacher's `relay::http_proxy::HttpProxy` (request ->
//! backend -> response shape, bracket-tagged logging) and in C7/C8 for the
//! actual dispatch; axum is the pack's HTTP server crate of choice (see
//! `Cargo.toml`'s `axum`/`axum-server` entries).

pub mod errors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use uuid::Uuid;

use crate::conversation::{run_conversation, ConversationOutcome, ConversationTable, RetryPolicy};
use crate::error::ServerError;
use crate::forwarding::{ForwardingBackend, HostServices};
use crate::protocol::codes::CommandByte;
use crate::protocol::{AuthenticationToken, BrokerProtocol, MessageType, Payload, PeerId, PrincipalIdentityInfo};
use crate::transport::FrameHeader;

/// Everything one inbound request needs: the forwarding backend it dispatches
/// through, the conversation table tracking in-flight replies, and the
/// bridge's fixed configuration. Cheap to clone — every field is an `Arc` or
/// `Copy`.
#[derive(Clone)]
pub struct BridgeState {
    pub forwarding: Arc<ForwardingBackend>,
    pub conversations: Arc<ConversationTable>,
    pub self_peer_id: PeerId,
    pub target_peer_id: PeerId,
    pub token_cookie_names: Arc<Vec<String>>,
    pub token_type_default: Option<String>,
    pub token_data_default: Option<String>,
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub graphql_error_formatting: bool,
}

/// The `HostServices` hook this bridge installs on its forwarding backend
/// (`ForwardingBackend::set_host_services`): every inbound frame is a reply
/// from the broker, parsed back into whichever conversation is waiting on it.
pub struct BridgeHost {
    conversations: Arc<ConversationTable>,
}

impl BridgeHost {
    pub fn new(conversations: Arc<ConversationTable>) -> Arc<Self> {
        Arc::new(Self { conversations })
    }
}

impl HostServices for BridgeHost {
    fn on_incoming(&self, _header: FrameHeader, payload: Vec<u8>) {
        let conversations = self.conversations.clone();
        tokio::spawn(async move {
            let envelope: BrokerProtocol = match serde_json::from_slice(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::warn!("[bridge] malformed reply payload, dropping: {err}");
                    return;
                }
            };
            if !conversations.on_message(&envelope).await {
                log::debug!(
                    "[bridge] reply for unknown conversation {}, treating as notification",
                    envelope.conversation_id
                );
            }
        });
    }
}

/// The bridge's single catch-all route: every method, every path, forwarded
/// the same way.
pub fn router(state: BridgeState) -> Router {
    Router::new().fallback(any(bridge_handler)).with_state(state)
}

async fn bridge_handler(
    State(state): State<BridgeState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = extract_token(
        &headers,
        &state.token_cookie_names,
        state.token_type_default.as_deref(),
        state.token_data_default.as_deref(),
    ) else {
        return error_response(
            &ServerError::AuthorizationFailed("no security token presented".into()),
            "missing security token",
            state.graphql_error_formatting,
        );
    };

    let conversation_id = Uuid::new_v4();
    let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcDispatch, conversation_id);
    envelope.source_peer_id = Some(state.self_peer_id);
    envelope.target_peer_id = Some(state.target_peer_id);
    envelope.principal_identity_info = Some(PrincipalIdentityInfo {
        authentication_token: Some(token),
        security_principal: None,
    });
    envelope.pass_through_user_data = Some(pass_through_user_data(&method, &uri, &headers));
    envelope.async_rpc_request = request_body_payload(&headers, &body);

    let message_id = envelope.message_id;
    let envelope_bytes = match serde_json::to_vec(&envelope) {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                &ServerError::Unexpected(anyhow::anyhow!(err)),
                "failed to encode bridged request",
                state.graphql_error_formatting,
            );
        }
    };

    let header = FrameHeader::new(
        CommandByte::SendChunk,
        Uuid::new_v4(),
        state.self_peer_id,
        state.target_peer_id,
    );

    log::debug!(
        "[bridge] {} {} -> conversation {conversation_id}",
        method,
        uri.path()
    );

    let outcome = run_conversation(
        &state.conversations,
        conversation_id,
        message_id,
        state.request_timeout,
        &state.retry_policy,
        || {
            let forwarding = state.forwarding.clone();
            let envelope_bytes = envelope_bytes.clone();
            let target = state.target_peer_id;
            async move { forwarding.push(target, header, envelope_bytes).await }
        },
    )
    .await;

    match outcome {
        ConversationOutcome::Completed(payload) => (StatusCode::OK, Json(payload)).into_response(),
        ConversationOutcome::Failed(error_json) => {
            let (status, body) = errors::forward_server_error_json(&error_json, state.graphql_error_formatting);
            (status, Json(body)).into_response()
        }
        ConversationOutcome::TimedOut => {
            error_response(&ServerError::Timeout, "request timed out", state.graphql_error_formatting)
        }
        ConversationOutcome::Cancelled(reason) => error_response(
            &ServerError::Unexpected(anyhow::anyhow!(reason)),
            "request cancelled",
            state.graphql_error_formatting,
        ),
    }
}

fn error_response(err: &ServerError, message: impl Into<String>, graphql: bool) -> Response {
    let status = errors::status_for(err.error_code());
    let body = errors::error_body(err, graphql, message);
    (status, Json(body)).into_response()
}

/// Parses the `Cookie` header(s) into a flat name -> value map. Malformed
/// pairs are skipped rather than rejecting the whole header.
fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// spec.md §4.C9's three-step token resolution: configured cookies in
/// order, then the configured default token, then nothing.
fn extract_token(
    headers: &HeaderMap,
    cookie_names: &[String],
    token_type_default: Option<&str>,
    token_data_default: Option<&str>,
) -> Option<AuthenticationToken> {
    let cookies = parse_cookies(headers);
    for name in cookie_names {
        if let Some(data) = cookies.get(name) {
            return Some(AuthenticationToken {
                token_type: name.clone(),
                data: data.clone(),
            });
        }
    }

    match (token_type_default, token_data_default) {
        (Some(token_type), Some(data)) => Some(AuthenticationToken {
            token_type: token_type.to_string(),
            data: data.to_string(),
        }),
        _ => None,
    }
}

fn pass_through_user_data(method: &Method, uri: &Uri, headers: &HeaderMap) -> Payload {
    let mut header_map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    serde_json::json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": header_map,
        "cookies": parse_cookies(headers),
    })
}

/// The request body becomes `asyncRpcRequest`, as raw JSON when the request
/// declares a JSON content type; otherwise as a UTF-8 (lossy) string, so a
/// non-JSON body still round-trips as something the far side can inspect.
fn request_body_payload(headers: &HeaderMap, body: &Bytes) -> Option<Payload> {
    if body.is_empty() {
        return None;
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_slice(body).ok()
    } else {
        Some(Payload::String(String::from_utf8_lossy(body).into_owned()))
    }
}
