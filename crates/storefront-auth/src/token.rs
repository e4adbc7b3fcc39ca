//! Token endpoint exchange and response interpretation
//!
//! Every grant (acquire and refresh alike) is a form POST to the configured
//! token URL. The response is interpreted in a fixed order: transport
//! failure, body-level rejection flag, 5xx, other non-2xx, then decoding the
//! success body.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::classify::RejectionShape;
use crate::credential::Credential;
use crate::error::{AuthError, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Success body from the token endpoint.
///
/// `expires_in` is a delta in seconds; `expires` is an absolute unix time in
/// seconds. Servers send one or the other (or neither).
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Build the credential issued at `now_ms`.
    ///
    /// An absolute `expires` already in the past yields a zero lifetime, so
    /// the credential is immediately stale rather than silently extended.
    pub fn into_credential(self, now_ms: u64, client_id: Option<String>) -> Result<Credential> {
        let access_token = self.access_token.unwrap_or_default();
        let lifetime = match (self.expires_in, self.expires) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, Some(epoch_secs)) => Some(Duration::from_millis(
                epoch_secs.saturating_mul(1000).saturating_sub(now_ms),
            )),
            (None, None) => None,
        };
        Ok(Credential::new(access_token, now_ms)?
            .with_token_type(self.token_type.unwrap_or_default())
            .with_refresh_token(self.refresh_token)
            .with_expires_in(lifetime)
            .with_client_id(client_id))
    }
}

/// Accept `3600` and `"3600"`.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// POST `form` to `token_url` and interpret the response.
pub async fn exchange(
    transport: &dyn Transport,
    token_url: &str,
    form: Vec<(String, String)>,
    shape: &RejectionShape,
) -> Result<TokenResponse> {
    let request = HttpRequest::post_form(token_url, form).header("Accept", "application/json");
    let response = transport.send(request).await.map_err(|e| {
        warn!(error = %e, "token endpoint unreachable");
        AuthError::Transport(e.0)
    })?;
    debug!(status = response.status, "token endpoint responded");
    interpret(&response, shape)
}

/// Map a token endpoint response to a `TokenResponse` or an `AuthError`.
pub fn interpret(response: &HttpResponse, shape: &RejectionShape) -> Result<TokenResponse> {
    let parsed = serde_json::from_str::<Value>(&response.body).ok();

    if let Some(message) = parsed.as_ref().and_then(|v| shape.rejection(v)) {
        return Err(AuthError::AuthRejected(message));
    }

    let server_message = || parsed.as_ref().and_then(|v| shape.message(v));

    if response.status >= 500 {
        return Err(AuthError::UnexpectedStatus {
            status: response.status,
            message: server_message().unwrap_or_else(|| "server unavailable".to_owned()),
        });
    }

    if !response.is_success() {
        return Err(AuthError::AuthRejected(server_message().unwrap_or_else(|| {
            format!("token endpoint returned {}", response.status)
        })));
    }

    let Some(body) = parsed else {
        return Err(AuthError::MalformedResponse(
            "token response is not JSON".into(),
        ));
    };

    let token: TokenResponse = serde_json::from_value(body.clone())
        .map_err(|e| AuthError::MalformedResponse(format!("invalid token response: {e}")))?;

    let has_token = token
        .access_token
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    if !has_token {
        // An OAuth-style error on a 2xx is still an explicit rejection
        if let Some(message) = body.get("error").and_then(|_| shape.message(&body)) {
            return Err(AuthError::AuthRejected(message));
        }
        return Err(AuthError::MalformedResponse(
            "token response has no access_token".into(),
        ));
    }

    Ok(token)
}
