//! Storefront credential CLI
//!
//! Signs in against the storefront token endpoint, keeps the credential in a
//! local secret file, and makes authorized API calls with it:
//!
//! ```text
//! storefront [--config PATH] login [--code CODE --verifier VERIFIER]
//! storefront [--config PATH] authorize-url
//! storefront [--config PATH] status
//! storefront [--config PATH] refresh
//! storefront [--config PATH] logout
//! storefront [--config PATH] get PATH [KEY=VALUE ...]
//! ```

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storefront_api::ApiClient;
use storefront_auth::{
    AuthorizationRequest, CodeExchange, FileSecretStore, ReqwestTransport, SystemClock,
    TokenManager, TokenState, Transport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Storefront credential CLI
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "storefront", version, about = "Storefront sign-in and API calls", long_about = None)]
struct Cli {
    /// Config file (overrides STOREFRONT_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Sign in with the configured grant, or exchange an authorization code
    Login {
        #[arg(long)]
        code: Option<String>,
        /// PKCE verifier printed by `authorize-url`
        #[arg(long, requires = "code")]
        verifier: Option<String>,
    },
    /// Print an authorization URL with a fresh PKCE challenge
    AuthorizeUrl,
    /// Show the credential state without token values
    Status,
    /// Refresh the stored credential now
    Refresh,
    /// Forget the stored credential
    Logout,
    /// Authorized GET against the configured API
    Get {
        path: String,
        /// Query parameters as KEY=VALUE
        #[arg(value_parser = parse_query_pair)]
        query: Vec<(String, String)>,
    },
}

fn parse_query_pair(pair: &str) -> std::result::Result<(String, String), String> {
    pair.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("query parameter must be KEY=VALUE, got: {pair}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support.
    // Logs go to stderr so stdout stays clean for command output.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        token_url = %config.auth.token_url,
        grant_type = %config.auth.grant_type,
        client_id = %config.auth.client_id,
        credentials_path = %config.storage.credentials_path.display(),
        "configuration loaded"
    );

    if cli.command == Command::AuthorizeUrl {
        return print_authorize_url(&config);
    }

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
        reqwest::Client::new(),
        config.timeout(),
    ));
    let store = FileSecretStore::open(config.storage.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credential store {}",
                config.storage.credentials_path.display()
            )
        })?;
    let manager = Arc::new(
        TokenManager::load(
            config.auth_config(),
            transport.clone(),
            Arc::new(store),
            Arc::new(SystemClock),
        )
        .await
        .context("invalid auth configuration")?,
    );
    manager.remember_identity(&config.identity()).await;

    let result = run(cli.command, &config, &manager, transport).await;
    manager.flush().await;
    result
}

async fn run(
    command: Command,
    config: &Config,
    manager: &Arc<TokenManager>,
    transport: Arc<dyn Transport>,
) -> Result<()> {
    match command {
        Command::Login { code, verifier } => {
            let identity = config.identity();
            let credential = match code {
                Some(code) => {
                    let mut exchange = CodeExchange::new(code);
                    if let Some(verifier) = verifier {
                        exchange = exchange.with_verifier(verifier);
                    }
                    if let Some(redirect_uri) = &config.auth.redirect_uri {
                        exchange = exchange.with_redirect_uri(redirect_uri.clone());
                    }
                    manager.acquire_with_code(&identity, &exchange).await
                }
                None => manager.acquire(&identity).await,
            }
            .context("sign in failed")?;
            println!(
                "signed in (refreshable: {})",
                credential.refresh_token().is_some()
            );
        }
        Command::AuthorizeUrl => print_authorize_url(config)?,
        Command::Status => println!("{}", status_json(manager).await),
        Command::Refresh => {
            manager.refresh().await.context("refresh failed")?;
            println!("credential refreshed");
        }
        Command::Logout => {
            manager.invalidate().await;
            println!("signed out");
        }
        Command::Get { path, query } => {
            let api = config
                .api
                .as_ref()
                .context("[api] base_url is not configured")?;
            let client = ApiClient::new(&api.base_url, manager.clone(), transport)?;
            let query: Vec<(&str, &str)> = query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let response = client
                .get(&path, &query)
                .await
                .with_context(|| format!("GET {path} failed"))?;
            println!("{}", response.body);
        }
    }
    Ok(())
}

fn print_authorize_url(config: &Config) -> Result<()> {
    let authorize_url = config
        .auth
        .authorize_url
        .as_deref()
        .context("auth.authorize_url is not configured")?;
    let redirect_uri = config
        .auth
        .redirect_uri
        .as_deref()
        .context("auth.redirect_uri is not configured")?;

    let (request, verifier) = AuthorizationRequest::generate(
        authorize_url,
        config.auth.client_id.clone(),
        redirect_uri,
        config.auth.scopes.clone(),
    );
    let url = request.to_url()?;
    println!(
        "{}",
        serde_json::json!({
            "url": url,
            "state": request.state,
            "code_verifier": verifier,
        })
    );
    Ok(())
}

async fn status_json(manager: &TokenManager) -> serde_json::Value {
    let state = manager.state().await;
    let remaining = manager.time_remaining().await.map(|d| d.as_secs());
    let (token_type, refreshable) = match &state {
        TokenState::NoCredential => (None, false),
        TokenState::Valid(c) | TokenState::Stale(c) | TokenState::Refreshing(c) => {
            (Some(c.token_type().to_owned()), c.refresh_token().is_some())
        }
    };
    serde_json::json!({
        "state": state.label(),
        "token_type": token_type,
        "refreshable": refreshable,
        "expires_in_secs": remaining,
    })
}
