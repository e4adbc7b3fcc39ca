//! Credential lifecycle for storefront API clients
//!
//! Acquires bearer credentials from an OAuth-style token endpoint, keeps
//! exactly one authoritative credential per `TokenManager`, refreshes it
//! before expiry, and invalidates it when the server says it is dead. The
//! credential survives restarts through a `SecretStore` shadow.
//!
//! Credential flow:
//! 1. `TokenManager::load()` restores the persisted shadow, if any
//! 2. `TokenManager::acquire()` exchanges client identity for a credential
//! 3. `TokenManager::ensure_valid()` hands out a fresh credential, refreshing
//!    a stale one through a single in-flight exchange
//! 4. `TokenManager::classify()` drops the credential on server rejection
//! 5. `refresh::spawn_refresh_task()` refreshes proactively in the background

use std::future::Future;
use std::pin::Pin;

pub mod classify;
pub mod clock;
pub mod config;
pub mod constants;
pub mod credential;
pub mod error;
pub mod grant;
pub mod manager;
mod metrics;
pub mod pkce;
pub mod refresh;
mod shadow;
pub mod store;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

/// Boxed future returned by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use classify::{CredentialVerdict, RejectionShape};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthConfig;
pub use credential::{Credential, ExpiryPolicy};
pub use error::{AuthError, Result};
pub use grant::{ClientIdentity, CodeExchange, GrantType};
pub use manager::{TokenManager, TokenState};
pub use pkce::{AuthorizationRequest, compute_challenge, generate_verifier};
pub use refresh::spawn_refresh_task;
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
