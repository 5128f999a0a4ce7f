//! Application error model with MCP error mapping
//!
//! Every failure the server can surface is one `AppError` variant. The
//! variant set mirrors the Graph failure taxonomy (auth, permission, lookup,
//! throttling, provider, timeout, local I/O) so callers can branch on
//! [`AppError::kind`] and [`AppError::retry_after_secs`] instead of parsing
//! message text.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// No cached or app-only credential is usable; human consent required
    #[error("authentication required: {0}; run `outlook-mcp-rs auth` to sign in")]
    AuthRequired(String),
    /// Graph rejected the bearer token (HTTP 401)
    #[error(
        "authentication failed (401): token may be expired or revoked; re-run `outlook-mcp-rs auth` if this persists: {0}"
    )]
    Unauthorized(String),
    /// Token is valid but lacks the required permission (HTTP 403)
    #[error("insufficient permissions (403): check the app registration scopes and re-consent: {0}")]
    Forbidden(String),
    /// Referenced resource does not exist (HTTP 404)
    #[error("resource not found (404): verify the id is correct: {0}")]
    NotFound(String),
    /// Provider throttling (HTTP 429)
    #[error("rate limited (429): retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds the provider asked us to wait
        retry_after_secs: u64,
    },
    /// Any other provider failure (non-2xx Graph status, token endpoint error)
    #[error("provider error: {0}")]
    Provider(String),
    /// No response within the request deadline
    #[error("request timed out: {0}; the Graph API may be slow, please retry")]
    Timeout(String),
    /// Local disk failure while persisting tokens or attachments
    #[error("I/O error: {0}")]
    Io(String),
    /// Invalid tool input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Internal error (unexpected failure, serialization)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Structured error discriminant
///
/// [`ErrorKind::as_str`] is the `code` field of MCP error data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthRequired,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    ProviderError,
    Timeout,
    IoError,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// Stable string code used in MCP error data
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::ProviderError => "provider_error",
            Self::Timeout => "timeout",
            Self::IoError => "io_error",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired(_) => ErrorKind::AuthRequired,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Provider(_) => ErrorKind::ProviderError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::IoError,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Retry hint in seconds, only for rate-limited calls
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry without human action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Unauthorized(_)
        )
    }

    /// Convert to MCP `ErrorData`
    ///
    /// The `data` payload always carries `code` (see [`ErrorKind::as_str`]);
    /// rate-limited errors add `retry_after_seconds`.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `AuthRequired`, `Unauthorized`, `Forbidden` → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let msg = self.to_string();
        let mut data = json!({ "code": self.kind().as_str() });
        if let Some(secs) = self.retry_after_secs() {
            data["retry_after_seconds"] = json!(secs);
        }
        match self {
            Self::InvalidInput(_) => ErrorData::invalid_params(msg, Some(data)),
            Self::NotFound(_) => ErrorData::resource_not_found(msg, Some(data)),
            Self::AuthRequired(_) | Self::Unauthorized(_) | Self::Forbidden(_) => {
                ErrorData::invalid_request(msg, Some(data))
            }
            Self::RateLimited { .. }
            | Self::Provider(_)
            | Self::Timeout(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorData::internal_error(msg, Some(data)),
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
