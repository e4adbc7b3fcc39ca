//! Defaults for the token lifecycle
//!
//! These are fallbacks only. Every value here can be overridden through
//! `AuthConfig`.

use std::time::Duration;

/// Lifetime assumed when the token endpoint omits both `expires_in` and
/// `expires`. Storefront access tokens are valid for one hour.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// A credential is treated as stale this long before its computed expiry, so
/// a request is never sent with a token that expires in transit.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// HTTP timeout for token exchange requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// SecretStore key holding the serialized current credential.
pub const CREDENTIAL_SHADOW_KEY: &str = "storefront.credential";

/// Token type used when the server omits `token_type`.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Body key carrying the boolean success flag in the rejection shape.
pub const DEFAULT_REJECTION_FLAG_KEY: &str = "status";

/// Body keys checked, in order, for the rejection message.
pub const DEFAULT_REJECTION_MESSAGE_KEYS: &[&str] = &["error", "errors"];

/// Fallback user-visible message when the server gives none.
pub const GENERIC_FAILURE_MESSAGE: &str = "authentication failed";
