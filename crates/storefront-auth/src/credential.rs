//! The credential value and its persisted shadow format
//!
//! A `Credential` is replaced wholesale, never mutated field by field, so it
//! exposes getters and builder-style constructors only. The shadow is a
//! versioned JSON envelope; unknown fields are ignored on read.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::millis;
use crate::constants::{DEFAULT_EXPIRY_SKEW, DEFAULT_TOKEN_LIFETIME, DEFAULT_TOKEN_TYPE};
use crate::error::{AuthError, Result};

const SHADOW_VERSION: u32 = 1;

/// An access token, its optional refresh token, and expiry metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    /// Unix milliseconds at which the exchange completed locally
    issued_at_ms: u64,
    /// Server-asserted lifetime. `None` means use the policy default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_in_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_owned()
}

impl Credential {
    /// Create a credential. Fails if `access_token` is empty.
    pub fn new(access_token: impl Into<String>, issued_at_ms: u64) -> Result<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(AuthError::MalformedResponse(
                "access token is empty".into(),
            ));
        }
        Ok(Self {
            access_token,
            refresh_token: None,
            token_type: default_token_type(),
            issued_at_ms,
            expires_in_secs: None,
            client_id: None,
        })
    }

    /// Empty or whitespace-only values leave the default `Bearer` in place.
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        let token_type = token_type.into();
        if !token_type.trim().is_empty() {
            self.token_type = token_type;
        }
        self
    }

    /// An empty refresh token is treated as absent.
    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_expires_in(mut self, expires_in: Option<Duration>) -> Self {
        self.expires_in_secs = expires_in.map(|d| d.as_secs());
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id.filter(|c| !c.is_empty());
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn issued_at_ms(&self) -> u64 {
        self.issued_at_ms
    }

    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in_secs.map(Duration::from_secs)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Value for the `Authorization` header: `<token_type> <access_token>`.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Serialize to the persisted shadow format.
    pub fn to_shadow(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&ShadowRef {
            version: SHADOW_VERSION,
            credential: self,
        })
        .map_err(|e| AuthError::Storage(format!("serializing credential shadow: {e}")))
    }

    /// Decode a persisted shadow. An empty access token is rejected so the
    /// caller can treat the shadow as absent.
    pub fn from_shadow(bytes: &[u8]) -> Result<Self> {
        let shadow: Shadow = serde_json::from_slice(bytes)
            .map_err(|e| AuthError::Storage(format!("parsing credential shadow: {e}")))?;
        if shadow.credential.access_token.trim().is_empty() {
            return Err(AuthError::Storage(
                "credential shadow has an empty access token".into(),
            ));
        }
        Ok(shadow.credential)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("issued_at_ms", &self.issued_at_ms)
            .field("expires_in_secs", &self.expires_in_secs)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Serialize)]
struct ShadowRef<'a> {
    version: u32,
    credential: &'a Credential,
}

#[derive(Deserialize)]
struct Shadow {
    #[serde(default)]
    #[allow(dead_code)]
    version: u32,
    credential: Credential,
}

/// Expiry rules: a default lifetime for credentials without one, and a skew
/// margin subtracted from every computed expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub default_lifetime: Duration,
    pub skew: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            default_lifetime: DEFAULT_TOKEN_LIFETIME,
            skew: DEFAULT_EXPIRY_SKEW,
        }
    }
}

impl ExpiryPolicy {
    /// Absolute expiry in unix milliseconds, before skew.
    pub fn expires_at_ms(&self, credential: &Credential) -> u64 {
        let lifetime = credential.expires_in().unwrap_or(self.default_lifetime);
        credential
            .issued_at_ms
            .saturating_add(millis(lifetime))
    }

    /// Whether the credential must not authorize new requests at `now_ms`.
    pub fn is_stale(&self, credential: &Credential, now_ms: u64) -> bool {
        now_ms.saturating_add(millis(self.skew)) >= self.expires_at_ms(credential)
    }

    /// Time left before the credential goes stale, zero if already stale.
    pub fn remaining(&self, credential: &Credential, now_ms: u64) -> Duration {
        let stale_at = self
            .expires_at_ms(credential)
            .saturating_sub(millis(self.skew));
        Duration::from_millis(stale_at.saturating_sub(now_ms))
    }
}
