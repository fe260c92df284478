//! Error -> HTTP status mapping (C9), exactly spec.md §4.C9's closed table.

use http::StatusCode;

use crate::error::{ErrorCode, ServerError, ServerErrorGraphQl, ServerErrorJson};

/// Maps a broker/generic error code to an HTTP status, per spec.md §4.C9:
///
/// | Error | HTTP status |
/// |-------|------------|
/// | `AuthorizationFailed` | 401 |
/// | `TargetPeerNotFound` | 503 |
/// | `TargetPeerQueueFull`, `ProtocolValidationFailed` | 500 |
/// | `no_such_file_or_directory` | 404 |
/// | `operation_not_supported` | 501 |
/// | `operation_not_permitted` | 403 |
/// | any other | 500 |
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthorizationFailed => StatusCode::UNAUTHORIZED,
        ErrorCode::TargetPeerNotFound => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::TargetPeerQueueFull | ErrorCode::ProtocolValidationFailed => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::NoSuchFileOrDirectory => StatusCode::NOT_FOUND,
        ErrorCode::OperationNotSupported => StatusCode::NOT_IMPLEMENTED,
        ErrorCode::OperationNotPermitted => StatusCode::FORBIDDEN,
        ErrorCode::ConnectionReset | ErrorCode::Timeout | ErrorCode::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the response body for a failed request, in the format the
/// `--graphql-error-formatting` switch selected.
pub fn error_body(err: &ServerError, graphql: bool, message: impl Into<String>) -> serde_json::Value {
    if graphql {
        serde_json::to_value(ServerErrorGraphQl::from(err)).unwrap_or_default()
    } else {
        serde_json::to_value(err.to_server_error_json(message)).unwrap_or_default()
    }
}

/// Same shape, but built directly from a `ServerErrorJson` a broker reply
/// already carried (`AsyncRpcAcknowledgment.serverErrorJson`), rather than
/// from a locally-raised `ServerError`.
pub fn forward_server_error_json(body: &ServerErrorJson, graphql: bool) -> (StatusCode, serde_json::Value) {
    let error_code = body
        .result
        .exception_properties
        .as_ref()
        .and_then(|p| p.error_code.as_deref())
        .and_then(parse_error_code)
        .unwrap_or(ErrorCode::Unexpected);

    let status = status_for(error_code);
    let value = if graphql {
        serde_json::json!({
            "errors": [{
                "message": body.result.message,
                "errorType": error_code.as_str(),
            }]
        })
    } else {
        serde_json::to_value(body).unwrap_or_default()
    };
    (status, value)
}

fn parse_error_code(s: &str) -> Option<ErrorCode> {
    Some(match s {
        "ProtocolValidationFailed" => ErrorCode::ProtocolValidationFailed,
        "AuthorizationFailed" => ErrorCode::AuthorizationFailed,
        "TargetPeerNotFound" => ErrorCode::TargetPeerNotFound,
        "TargetPeerQueueFull" => ErrorCode::TargetPeerQueueFull,
        "ConnectionReset" => ErrorCode::ConnectionReset,
        "Timeout" => ErrorCode::Timeout,
        "no_such_file_or_directory" => ErrorCode::NoSuchFileOrDirectory,
        "operation_not_supported" => ErrorCode::OperationNotSupported,
        "operation_not_permitted" => ErrorCode::OperationNotPermitted,
        _ => return None,
    })
}
