//! Authorized request errors

use storefront_auth::AuthError;
use thiserror::Error;

/// Errors from `ApiClient` calls.
#[derive(Error, Debug)]
pub enum ApiError {
    /// No usable credential could be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The server rejected the credential; it has been invalidated.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// Detail is kept for logs and never displayed.
    #[error("could not reach the storefront API")]
    Transport(String),

    /// Non-2xx response that does not concern the credential.
    #[error("API returned {status}")]
    Status { status: u16, body: String },

    #[error("could not decode API response: {0}")]
    Decode(String),

    #[error("invalid request URL: {0}")]
    Url(String),
}

/// Result alias using ApiError
pub type Result<T> = std::result::Result<T, ApiError>;
