//! Error types for token lifecycle operations
//!
//! Display strings are the user-visible messages. Transport and decode
//! details are kept in the variant for logging but never rendered, so a raw
//! transport error never reaches the user.

/// Errors from token exchange, refresh and credential storage.
///
/// `Clone` so a single refresh outcome can be fanned out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No response at all (connect failure, timeout, TLS).
    #[error("could not reach the authentication server")]
    Transport(String),

    /// The token endpoint answered with a 5xx status.
    #[error("authentication server error ({status}): {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// 2xx with a body that does not decode into a credential.
    #[error("authentication server returned an unreadable response")]
    MalformedResponse(String),

    /// The server explicitly rejected the grant or the credential.
    #[error("{0}")]
    AuthRejected(String),

    /// An authorized call was requested with nothing stored.
    #[error("no credential is stored; sign in first")]
    NoCredentialAvailable,

    /// The stored credential is stale and could not be refreshed.
    #[error("credential expired, sign in again: {0}")]
    ReauthenticationRequired(String),

    /// The caller supplied unusable grant material.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("secret store error: {0}")]
    Storage(String),

    /// The in-flight refresh ended without publishing a result.
    #[error("token refresh was interrupted")]
    RefreshInterrupted,
}

impl AuthError {
    /// Whether retrying the same call unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Transport(_)
                | AuthError::UnexpectedStatus { .. }
                | AuthError::RefreshInterrupted
        )
    }

    /// Metric/log label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Transport(_) => "transport",
            AuthError::UnexpectedStatus { .. } => "unexpected_status",
            AuthError::MalformedResponse(_) => "malformed_response",
            AuthError::AuthRejected(_) => "rejected",
            AuthError::NoCredentialAvailable => "no_credential",
            AuthError::ReauthenticationRequired(_) => "reauthentication_required",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::Storage(_) => "storage",
            AuthError::RefreshInterrupted => "refresh_interrupted",
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
