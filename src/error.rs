// Error handling module
// Defines the failure taxonomy of the request pipeline

use thiserror::Error;

use crate::http_client::ApiRequest;

/// Why a credential refresh could not produce a usable session.
/// Cloneable so every caller attached to one exchange receives the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// Neither the session store nor the persistent cache holds a refresh credential
    #[error("No refresh credential available")]
    NoRefreshCredential,

    /// The refresh endpoint answered with a non-success status
    #[error("Refresh exchange failed: {status} - {message}")]
    RefreshExchangeFailed { status: u16, message: String },

    /// The refresh request never got a response
    #[error("Refresh transport error: {0}")]
    Transport(String),

    /// The refresh exchange exceeded its time bound
    #[error("Refresh exchange timed out")]
    Timeout,

    /// The refresh endpoint answered 2xx with an unusable body
    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),

    /// The session was cleared while the exchange was in flight
    #[error("Session was cleared during refresh")]
    SessionCleared,
}

/// Errors returned to callers of the request pipeline
#[derive(Error, Debug)]
pub enum ApiError {
    /// Server rejected the access credential (HTTP 401).
    /// Carries the original request and the credential that was presented.
    #[error("Access credential expired or rejected")]
    ExpiredCredential {
        request: Box<ApiRequest>,
        presented: Option<String>,
    },

    /// Non-auth error status, body passed through verbatim
    #[error("Request failed: {status} - {body}")]
    RequestFailed { status: u16, body: String },

    /// Network, timeout or body transfer failure
    #[error("Transport failure ({kind}): {message}")]
    TransportFailure { kind: &'static str, message: String },

    /// The session could not be refreshed and has been torn down
    #[error("Authentication lost: {0}")]
    AuthenticationLost(RefreshFailure),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A success body could not be decoded into the expected type
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Categorize a reqwest error as a transport failure
    pub fn from_transport(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::TransportFailure {
            kind,
            message: e.to_string(),
        }
    }

    /// HTTP status attached to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ExpiredCredential { .. } => Some(401),
            ApiError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for failures that mean the user has to sign in again
    pub fn is_auth_lost(&self) -> bool {
        matches!(self, ApiError::AuthenticationLost(_))
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ApiError>;
