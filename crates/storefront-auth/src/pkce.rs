//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! For `authorization_code` clients: the verifier stays with the client and
//! is sent during the code exchange; the challenge goes in the authorization
//! URL so the server can tie the exchange to the party that started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AuthError, Result};

/// Generate a random PKCE code verifier.
///
/// 128 random bytes as URL-safe base64 without padding: 171 characters,
/// the top of the 43-128 byte range RFC 7636 allows before encoding.
pub fn generate_verifier() -> String {
    random_url_safe::<128>()
}

/// `BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Opaque CSRF value echoed back by the authorization server.
pub fn generate_state() -> String {
    random_url_safe::<32>()
}

fn random_url_safe<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters of an authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Option<String>,
    pub state: String,
    pub code_challenge: String,
}

impl AuthorizationRequest {
    /// Fresh request with a generated state. Returns the request and the
    /// verifier to keep for `CodeExchange`.
    pub fn generate(
        authorize_url: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Option<String>,
    ) -> (Self, String) {
        let verifier = generate_verifier();
        let request = Self {
            authorize_url: authorize_url.into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            state: generate_state(),
            code_challenge: compute_challenge(&verifier),
        };
        (request, verifier)
    }

    /// Full authorization URL with every OAuth parameter query-encoded.
    pub fn to_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.authorize_url).map_err(|e| {
            AuthError::InvalidRequest(format!("invalid authorize_url {}: {e}", self.authorize_url))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri);
            if let Some(scopes) = self.scopes.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("scope", scopes);
            }
            query
                .append_pair("code_challenge", &self.code_challenge)
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", &self.state);
        }
        Ok(url.into())
    }
}
