// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types of the widget driver.
//!
//! Two layers exist here: [`Error`] is what the driver and its collaborators
//! (the Matrix client, the transport) pass around internally, while
//! [`ErrorCode`] and [`ErrorBody`] are the wire representation a widget
//! receives in an `error` response.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Machine-readable error codes of the widget API wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The operation is not covered by the approved capabilities, or targets
    /// a crypto event.
    #[serde(rename = "M_FORBIDDEN")]
    Forbidden,
    /// The request body was malformed or missing required fields.
    #[serde(rename = "M_INVALID_REQUEST")]
    InvalidRequest,
    /// The requested event or state entry does not exist.
    #[serde(rename = "M_NOT_FOUND")]
    NotFound,
    /// Too many requests are in flight, or the homeserver rate-limited us.
    #[serde(rename = "M_LIMIT_EXCEEDED")]
    LimitExceeded,
    /// A pending request expired before the client answered.
    #[serde(rename = "M_TIMEOUT")]
    Timeout,
    /// The transport to the widget faulted.
    #[serde(rename = "M_TRANSPORT_ERROR")]
    TransportError,
    /// The operation is not permitted in the current capability state.
    #[serde(rename = "M_INVALID_STATE")]
    InvalidState,
    /// The action is unknown or the feature unsupported.
    #[serde(rename = "M_UNRECOGNIZED")]
    Unrecognized,
    /// Any failure that fits no other category.
    #[serde(rename = "M_UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    /// The wire string of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Forbidden => "M_FORBIDDEN",
            ErrorCode::InvalidRequest => "M_INVALID_REQUEST",
            ErrorCode::NotFound => "M_NOT_FOUND",
            ErrorCode::LimitExceeded => "M_LIMIT_EXCEEDED",
            ErrorCode::Timeout => "M_TIMEOUT",
            ErrorCode::TransportError => "M_TRANSPORT_ERROR",
            ErrorCode::InvalidState => "M_INVALID_STATE",
            ErrorCode::Unrecognized => "M_UNRECOGNIZED",
            ErrorCode::Unknown => "M_UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that occur while driving the widget API.
#[derive(Debug, Error)]
pub enum Error {
    /// The approved capabilities do not cover the operation.
    #[error("operation not covered by the approved capabilities: {0}")]
    Forbidden(String),

    /// A widget request could not be decoded.
    #[error("malformed widget request: {0}")]
    InvalidRequest(String),

    /// The requested event or state entry does not exist.
    #[error("event or state not found: {0}")]
    NotFound(String),

    /// The pending-request registry is full.
    #[error("too many requests in flight")]
    TooManyPending,

    /// A pending request expired before it was answered.
    #[error("request timed out")]
    Timeout,

    /// The transport to the widget faulted.
    #[error("widget transport failure: {0}")]
    Transport(String),

    /// The homeserver rate-limited the operation.
    #[error("rate limited by the homeserver")]
    RateLimited {
        /// How long to wait before retrying, if the server said.
        retry_after: Option<Duration>,
    },

    /// The operation is not permitted in the current capability state.
    #[error("operation not permitted in the current capability state")]
    InvalidState,

    /// The widget sent an action this driver does not implement.
    #[error("unsupported widget action: {0}")]
    Unrecognized(String),

    /// Any other failure reported by the embedding client.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The wire error code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::TooManyPending | Error::RateLimited { .. } => ErrorCode::LimitExceeded,
            Error::Timeout => ErrorCode::Timeout,
            Error::Transport(_) => ErrorCode::TransportError,
            Error::InvalidState => ErrorCode::InvalidState,
            Error::Unrecognized(_) => ErrorCode::Unrecognized,
            Error::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Transport faults and timeouts are retriable. A rate limit is retriable
    /// only if the server said when. Everything else is final for the
    /// request that caused it.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout => true,
            Error::RateLimited { retry_after } => retry_after.is_some(),
            _ => false,
        }
    }
}

/// Wire form of an `error` response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// The underlying Matrix API error, if one was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix_error: Option<JsonValue>,
    /// Milliseconds to wait before retrying a rate-limited request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorBody {
    /// Creates a body with just a code and a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), matrix_error: None, retry_after_ms: None }
    }

    /// Creates the body describing the given driver error.
    pub fn from_error(error: &Error) -> Self {
        let retry_after_ms = match error {
            Error::RateLimited { retry_after } => retry_after.map(|d| d.as_millis() as u64),
            _ => None,
        };
        Self { code: error.code(), message: error.to_string(), matrix_error: None, retry_after_ms }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{Error, ErrorBody, ErrorCode};

    #[test]
    fn codes_map_to_wire_strings() {
        assert_eq!(Error::Forbidden("send".to_owned()).code().as_str(), "M_FORBIDDEN");
        assert_eq!(Error::TooManyPending.code().as_str(), "M_LIMIT_EXCEEDED");
        assert_eq!(Error::RateLimited { retry_after: None }.code().as_str(), "M_LIMIT_EXCEEDED");
        assert_eq!(Error::Other("boom".to_owned()).code().as_str(), "M_UNKNOWN");
    }

    #[test]
    fn retriable_classification() {
        assert!(Error::Transport("eof".to_owned()).is_retriable());
        assert!(Error::Timeout.is_retriable());
        assert!(!Error::RateLimited { retry_after: None }.is_retriable());
        assert!(Error::RateLimited { retry_after: Some(Duration::from_secs(1)) }.is_retriable());
        assert!(!Error::Forbidden("nope".to_owned()).is_retriable());
        assert!(!Error::InvalidState.is_retriable());
    }

    #[test]
    fn error_body_serialization() {
        let body = ErrorBody::new(ErrorCode::Forbidden, "not allowed");
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({ "code": "M_FORBIDDEN", "message": "not allowed" })
        );

        let body = ErrorBody::from_error(&Error::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        });
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "code": "M_LIMIT_EXCEEDED",
                "message": "rate limited by the homeserver",
                "retry_after_ms": 1500,
            })
        );
    }
}
