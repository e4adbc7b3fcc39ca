//! Authorized request glue
//!
//! Every call asks the manager for a valid credential, attaches it, sends
//! the request, and lets the manager classify the response. A rejected
//! credential is invalidated by the manager before the error reaches the
//! caller.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use storefront_auth::{CredentialVerdict, HttpRequest, HttpResponse, TokenManager, Transport};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ApiError, Result};

/// Client for authorized storefront API calls.
pub struct ApiClient {
    base_url: Url,
    manager: Arc<TokenManager>,
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        manager: Arc<TokenManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ApiError::Url(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Url(format!("{base_url} cannot be a base URL")));
        }
        Ok(Self {
            base_url,
            manager,
            transport,
        })
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    /// `base_url` + `path`, with `query` form-urlencoded.
    pub fn url_for(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    /// Authorized GET. Returns the 2xx response.
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<HttpResponse> {
        let credential = self.manager.ensure_valid().await?;
        let url = self.url_for(path, query);

        let request = HttpRequest::get(url.as_str())
            .header("Authorization", credential.authorization_header())
            .header("Accept", "application/json");
        let response = self.transport.send(request).await.map_err(|e| {
            warn!(path, error = %e, "API request failed");
            ApiError::Transport(e.0)
        })?;
        debug!(path, status = response.status, "API responded");

        if let CredentialVerdict::Rejected(message) = self
            .manager
            .classify_for(&credential, response.status, &response.body)
            .await
        {
            return Err(ApiError::CredentialRejected(message));
        }

        if !response.is_success() {
            return Err(ApiError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }

    /// Authorized GET decoding the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self.get(path, query).await?;
        serde_json::from_str(&response.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
