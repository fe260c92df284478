//! Wire-visible error taxonomy.
//!
//! `ServerError` is the one error type that crosses every component boundary
//! in this crate: it is what `DataBlock` bounds checks return, what the
//! broker routing engine surfaces as an `AsyncRpcAcknowledgment.serverErrorJson`,
//! and what the HTTP bridge maps onto a status code. Everything else in the
//! crate either returns `ServerError` directly or wraps it in `anyhow::Error`
//! at the CLI/config/I/O-setup edges.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of broker/protocol error codes. Named to match the categories
/// spec.md §7 enumerates; the string form is what travels on the wire inside
/// `exceptionProperties.errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolValidationFailed,
    AuthorizationFailed,
    TargetPeerNotFound,
    TargetPeerQueueFull,
    ConnectionReset,
    Timeout,
    NoSuchFileOrDirectory,
    OperationNotSupported,
    OperationNotPermitted,
    Unexpected,
}

impl ErrorCode {
    /// The wire string used in `exceptionProperties.errorCode`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolValidationFailed => "ProtocolValidationFailed",
            Self::AuthorizationFailed => "AuthorizationFailed",
            Self::TargetPeerNotFound => "TargetPeerNotFound",
            Self::TargetPeerQueueFull => "TargetPeerQueueFull",
            Self::ConnectionReset => "ConnectionReset",
            Self::Timeout => "Timeout",
            Self::NoSuchFileOrDirectory => "no_such_file_or_directory",
            Self::OperationNotSupported => "operation_not_supported",
            Self::OperationNotPermitted => "operation_not_permitted",
            Self::Unexpected => "Unexpected",
        }
    }
}

/// Optional SSL-verification detail, carried only when the failure
/// originated from the TLS handshake. Field names follow
/// `original_source/.../data/models/ErrorHandling.h`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SslVerificationInfo {
    #[serde(rename = "isVerifyFailed", skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_failed: Option<bool>,
    #[serde(rename = "isVerifyError", skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error: Option<bool>,
    #[serde(rename = "isVerifyErrorMessage", skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error_message: Option<String>,
    #[serde(rename = "isVerifyErrorString", skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error_string: Option<String>,
    #[serde(rename = "isVerifySubjectName", skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_subject_name: Option<String>,
}

/// The taxonomy error type. Every variant carries enough to rebuild the
/// wire-visible `ExceptionProperties` bag without re-deriving it at each
/// call site.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("protocol validation failed: {0}")]
    ProtocolValidationFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("target peer not found: {target}")]
    TargetPeerNotFound { target: String },

    #[error("target peer queue full: {target}")]
    TargetPeerQueueFull { target: String },

    #[error("connection reset")]
    ConnectionReset,

    #[error("operation timed out")]
    Timeout,

    #[error("argument error: {0}")]
    ArgumentError(String),

    #[error("tls error: {0}")]
    Tls(SslVerificationInfo),

    #[error("unexpected internal error: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl ServerError {
    /// Mirrors baselib's `isExpected`: controls log noise and whether a
    /// failure contributes to watchdog counters. Expected failures are
    /// everything that is a normal consequence of client behavior or of a
    /// peer going away; unexpected failures are bugs or resource exhaustion.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Unexpected(_))
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ProtocolValidationFailed(_) => ErrorCode::ProtocolValidationFailed,
            Self::AuthorizationFailed(_) => ErrorCode::AuthorizationFailed,
            Self::TargetPeerNotFound { .. } => ErrorCode::TargetPeerNotFound,
            Self::TargetPeerQueueFull { .. } => ErrorCode::TargetPeerQueueFull,
            Self::ConnectionReset => ErrorCode::ConnectionReset,
            Self::Timeout => ErrorCode::Timeout,
            Self::ArgumentError(_) => ErrorCode::Unexpected,
            Self::Tls(_) => ErrorCode::AuthorizationFailed,
            Self::Unexpected(_) => ErrorCode::Unexpected,
        }
    }

    /// Classify a raw I/O error the way C3 framing does: "expected at
    /// close" errors are logged at debug, everything else at error.
    pub fn from_io_expected_at_close(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    }

    /// Build the wire-visible `ServerErrorJson` for this error.
    pub fn to_server_error_json(&self, message: impl Into<String>) -> ServerErrorJson {
        let props = ExceptionProperties {
            error_code: Some(self.error_code().as_str().to_string()),
            is_expected: Some(self.is_expected()),
            ..Default::default()
        };

        ServerErrorJson {
            result: ServerErrorResult {
                message: message.into(),
                exception_type: format!("{self:?}")
                    .split(['(', '{'])
                    .next()
                    .unwrap_or("ServerError")
                    .trim()
                    .to_string(),
                exception_message: self.to_string(),
                exception_full_dump: format!("{self:?}"),
                exception_properties: Some(props),
            },
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        if Self::from_io_expected_at_close(&err) {
            Self::ConnectionReset
        } else {
            Self::Unexpected(err.into())
        }
    }
}

/// The (flattened) bag of optional fields from `ErrorHandling.h` relevant to
/// this crate. Unknown keys round-trip via `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionProperties {
    #[serde(rename = "errno", skip_serializing_if = "Option::is_none")]
    pub err_no: Option<i32>,
    #[serde(rename = "categoryName", skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(rename = "errorCodeMessage", skip_serializing_if = "Option::is_none")]
    pub error_code_message: Option<String>,
    #[serde(rename = "isExpected", skip_serializing_if = "Option::is_none")]
    pub is_expected: Option<bool>,
    #[serde(rename = "httpStatusCode", skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(flatten)]
    pub ssl: SslVerificationInfo,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorResult {
    pub message: String,
    #[serde(rename = "exceptionType")]
    pub exception_type: String,
    #[serde(rename = "exceptionMessage")]
    pub exception_message: String,
    #[serde(rename = "exceptionFullDump")]
    pub exception_full_dump: String,
    #[serde(rename = "exceptionProperties", skip_serializing_if = "Option::is_none")]
    pub exception_properties: Option<ExceptionProperties>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorJson {
    pub result: ServerErrorResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(rename = "errorType")]
    pub error_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerErrorGraphQl {
    pub errors: Vec<GraphQlError>,
}

impl From<&ServerError> for ServerErrorGraphQl {
    fn from(err: &ServerError) -> Self {
        Self {
            errors: vec![GraphQlError {
                message: err.to_string(),
                error_type: err.error_code().as_str().to_string(),
            }],
        }
    }
}
