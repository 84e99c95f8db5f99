//! Error taxonomy for the bridge.
//!
//! `AuthError` and `BridgeError::Config` abort a feed, `RemoteError` aborts a
//! single field, and `BridgeError::Validation` is a silent rejection at the
//! follow-up endpoint.

use thiserror::Error;

/// OAuth failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The authorization code does not exist or has expired.
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    /// The refresh token was rejected (or missing).
    #[error("refresh_denied: {0}")]
    RefreshDenied(String),
    /// No token has been stored yet.
    #[error("not_configured")]
    NotConfigured,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidGrant(_) => "invalid_grant",
            AuthError::RefreshDenied(_) => "refresh_denied",
            AuthError::NotConfigured => "not_configured",
        }
    }

    /// Message suitable for the settings page.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidGrant(_) => {
                "The authentication code you provided does not exist or has expired.".to_string()
            }
            AuthError::RefreshDenied(msg) => format!("Unable to refresh Google access: {msg}"),
            AuthError::NotConfigured => "Google Sheets has not been authorized yet.".to_string(),
        }
    }
}

/// Failures talking to the spreadsheet/drive APIs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("remote error {code}: {body}")]
    Status { code: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Transient failures a caller may choose to retry. The client never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout | RemoteError::RateLimited(_) => true,
            RemoteError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }

    /// Map a non-success HTTP status into the taxonomy.
    pub fn from_status(code: u16, body: String) -> Self {
        match code {
            401 | 403 => RemoteError::Permission(body),
            404 => RemoteError::NotFound(body),
            429 => RemoteError::RateLimited(body),
            _ => RemoteError::Status { code, body },
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl BridgeError {
    /// Whether this error stops the whole feed rather than a single field.
    pub fn aborts_feed(&self) -> bool {
        matches!(
            self,
            BridgeError::Auth(_) | BridgeError::Config(_) | BridgeError::Storage(_)
        )
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Storage(format!("{err:#}"))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
