//! Grant types and token request form construction

use std::fmt;
use std::str::FromStr;

use common::Secret;
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// OAuth grant used for the initial acquire exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Public client without a secret
    Implicit,
    ClientCredentials,
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::Implicit => "implicit",
            GrantType::ClientCredentials => "client_credentials",
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "implicit" => Ok(GrantType::Implicit),
            "client_credentials" => Ok(GrantType::ClientCredentials),
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            other => Err(AuthError::InvalidRequest(format!(
                "unknown grant type: {other}"
            ))),
        }
    }
}

/// Client identity presented to the token endpoint.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, client_secret: Option<Secret<String>>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Public client: no secret.
    pub fn public(client_id: impl Into<String>) -> Self {
        Self::new(client_id, None)
    }

    /// Check the identity is usable for `grant`.
    ///
    /// `client_id` is always required. `client_credentials` requires a
    /// non-blank secret; other grants only reject a secret that is present
    /// but blank.
    pub fn validate_for(&self, grant: GrantType) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidRequest("client_id must not be empty".into()));
        }
        match (&self.client_secret, grant) {
            (None, GrantType::ClientCredentials) => Err(AuthError::InvalidRequest(
                "client_credentials grant requires a client secret".into(),
            )),
            (Some(secret), GrantType::Implicit) if secret.is_blank() => Ok(()),
            (Some(secret), _) if secret.is_blank() => Err(AuthError::InvalidRequest(
                "client secret must not be empty".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Authorization code material for the `authorization_code` grant.
#[derive(Debug, Clone)]
pub struct CodeExchange {
    pub code: String,
    /// PKCE verifier, when the authorization request carried a challenge
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
}

impl CodeExchange {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            code_verifier: None,
            redirect_uri: None,
        }
    }

    pub fn with_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.code_verifier = Some(verifier.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }
}

/// Build the form for an acquire exchange.
///
/// The secret is omitted for `implicit` and whenever it is absent.
pub(crate) fn acquire_form(
    grant: GrantType,
    identity: &ClientIdentity,
    code: Option<&CodeExchange>,
    scopes: Option<&str>,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("grant_type".to_owned(), grant.as_str().to_owned()),
        ("client_id".to_owned(), identity.client_id.clone()),
    ];
    if grant != GrantType::Implicit {
        if let Some(secret) = &identity.client_secret {
            form.push(("client_secret".to_owned(), secret.expose().clone()));
        }
    }
    if let Some(code) = code {
        form.push(("code".to_owned(), code.code.clone()));
        if let Some(verifier) = &code.code_verifier {
            form.push(("code_verifier".to_owned(), verifier.clone()));
        }
        if let Some(redirect_uri) = &code.redirect_uri {
            form.push(("redirect_uri".to_owned(), redirect_uri.clone()));
        }
    }
    if let Some(scopes) = scopes.filter(|s| !s.is_empty()) {
        form.push(("scope".to_owned(), scopes.to_owned()));
    }
    form
}

/// Build the form for a refresh exchange.
pub(crate) fn refresh_form(
    refresh_token: &str,
    client_id: Option<&str>,
    client_secret: Option<&Secret<String>>,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("grant_type".to_owned(), GrantType::RefreshToken.as_str().to_owned()),
        ("refresh_token".to_owned(), refresh_token.to_owned()),
    ];
    if let Some(client_id) = client_id {
        form.push(("client_id".to_owned(), client_id.to_owned()));
    }
    if let Some(secret) = client_secret.filter(|s| !s.is_blank()) {
        form.push(("client_secret".to_owned(), secret.expose().clone()));
    }
    form
}
