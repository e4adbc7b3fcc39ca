//! Configuration types and loading
//!
//! Config precedence: `--config` > `STOREFRONT_CONFIG` > `storefront.toml`.
//! The client secret is loaded from `STOREFRONT_CLIENT_SECRET` or
//! `client_secret_file`, never stored in the TOML directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use storefront_auth::constants::{
    CREDENTIAL_SHADOW_KEY, DEFAULT_EXPIRY_SKEW, DEFAULT_HTTP_TIMEOUT, DEFAULT_TOKEN_LIFETIME,
};
use storefront_auth::{AuthConfig, ClientIdentity, GrantType, RejectionShape};

pub const CONFIG_ENV: &str = "STOREFRONT_CONFIG";
pub const CLIENT_SECRET_ENV: &str = "STOREFRONT_CLIENT_SECRET";
const DEFAULT_CONFIG_PATH: &str = "storefront.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub auth: AuthSection,
    #[serde(default)]
    pub api: Option<ApiSection>,
    #[serde(default)]
    pub storage: StorageSection,
}

/// Token endpoint and client identity
#[derive(Debug, Deserialize)]
pub struct AuthSection {
    pub token_url: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: GrantType,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default)]
    pub scopes: Option<String>,
    #[serde(default = "default_lifetime_secs")]
    pub default_lifetime_secs: u64,
    #[serde(default = "default_expiry_skew_secs")]
    pub expiry_skew_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Only needed for authorization_code clients
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_shadow_key")]
    pub shadow_key: String,
    #[serde(default)]
    pub rejection: RejectionShape,
}

/// Authorized API settings
#[derive(Debug, Deserialize)]
pub struct ApiSection {
    pub base_url: String,
}

/// Where the credential shadow lives
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

fn default_grant_type() -> GrantType {
    GrantType::ClientCredentials
}

fn default_lifetime_secs() -> u64 {
    DEFAULT_TOKEN_LIFETIME.as_secs()
}

fn default_expiry_skew_secs() -> u64 {
    DEFAULT_EXPIRY_SKEW.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT.as_secs()
}

fn default_shadow_key() -> String {
    CREDENTIAL_SHADOW_KEY.to_owned()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("storefront-credentials.json")
}

fn require_http_url(name: &str, value: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then resolve the client secret.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.auth.client_secret =
            common::resolve_secret(CLIENT_SECRET_ENV, config.auth.client_secret_file.as_deref())?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let auth = &self.auth;
        require_http_url("token_url", &auth.token_url)?;
        if let Some(url) = &auth.authorize_url {
            require_http_url("authorize_url", url)?;
        }
        if let Some(api) = &self.api {
            require_http_url("base_url", &api.base_url)?;
        }
        if auth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }
        if auth.grant_type == GrantType::RefreshToken {
            return Err(common::Error::Config(
                "grant_type refresh_token cannot be used to sign in".into(),
            ));
        }
        if auth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if auth.default_lifetime_secs == 0 {
            return Err(common::Error::Config(
                "default_lifetime_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or `STOREFRONT_CONFIG`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        common::resolve_config_path(cli_path, CONFIG_ENV, DEFAULT_CONFIG_PATH)
    }

    pub fn auth_config(&self) -> AuthConfig {
        let auth = &self.auth;
        let mut config = AuthConfig::new(auth.token_url.clone())
            .with_grant_type(auth.grant_type)
            .with_default_lifetime(Duration::from_secs(auth.default_lifetime_secs))
            .with_expiry_skew(Duration::from_secs(auth.expiry_skew_secs))
            .with_rejection_shape(auth.rejection.clone())
            .with_shadow_key(auth.shadow_key.clone());
        if let Some(scopes) = &auth.scopes {
            config = config.with_scopes(scopes.clone());
        }
        config
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.auth.client_id.clone(), self.auth.client_secret.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.auth.timeout_secs)
    }
}
