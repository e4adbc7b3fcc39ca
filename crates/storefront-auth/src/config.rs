//! Token manager configuration

use std::time::Duration;

use crate::classify::RejectionShape;
use crate::constants::{CREDENTIAL_SHADOW_KEY, DEFAULT_EXPIRY_SKEW, DEFAULT_TOKEN_LIFETIME};
use crate::credential::ExpiryPolicy;
use crate::error::{AuthError, Result};
use crate::grant::GrantType;

/// Everything the manager needs to know about the token endpoint.
///
/// Client identity is passed to `TokenManager::acquire` by the caller.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token_url: String,
    /// Grant used by `acquire`
    pub grant_type: GrantType,
    pub scopes: Option<String>,
    pub expiry: ExpiryPolicy,
    pub rejection: RejectionShape,
    /// SecretStore key for the persisted shadow
    pub shadow_key: String,
}

impl AuthConfig {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            grant_type: GrantType::ClientCredentials,
            scopes: None,
            expiry: ExpiryPolicy {
                default_lifetime: DEFAULT_TOKEN_LIFETIME,
                skew: DEFAULT_EXPIRY_SKEW,
            },
            rejection: RejectionShape::default(),
            shadow_key: CREDENTIAL_SHADOW_KEY.to_owned(),
        }
    }

    pub fn with_grant_type(mut self, grant_type: GrantType) -> Self {
        self.grant_type = grant_type;
        self
    }

    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = Some(scopes.into());
        self
    }

    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.expiry.default_lifetime = lifetime;
        self
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry.skew = skew;
        self
    }

    pub fn with_rejection_shape(mut self, shape: RejectionShape) -> Self {
        self.rejection = shape;
        self
    }

    pub fn with_shadow_key(mut self, key: impl Into<String>) -> Self {
        self.shadow_key = key.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.token_url.starts_with("http://") && !self.token_url.starts_with("https://") {
            return Err(AuthError::InvalidRequest(format!(
                "token_url must start with http:// or https://, got: {}",
                self.token_url
            )));
        }
        if self.grant_type == GrantType::RefreshToken {
            return Err(AuthError::InvalidRequest(
                "refresh_token cannot be the acquire grant".into(),
            ));
        }
        if self.expiry.default_lifetime.is_zero() {
            return Err(AuthError::InvalidRequest(
                "default token lifetime must be greater than 0".into(),
            ));
        }
        if self.shadow_key.is_empty() {
            return Err(AuthError::InvalidRequest("shadow_key must not be empty".into()));
        }
        if self.rejection.flag_key.is_empty() {
            return Err(AuthError::InvalidRequest(
                "rejection flag_key must not be empty".into(),
            ));
        }
        Ok(())
    }
}
