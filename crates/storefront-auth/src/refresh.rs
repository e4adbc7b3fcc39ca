//! Proactive background token refresh
//!
//! A periodic task that refreshes the credential once it comes within a
//! threshold of going stale, so request paths rarely pay refresh latency.
//! It goes through `TokenManager::refresh` and joins any refresh already in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::manager::{TokenManager, TokenState};

/// Spawn a task that checks the credential every `interval` and refreshes it
/// when it expires within `threshold`.
///
/// Transient failures are retried on the next tick. A rejected refresh
/// leaves the manager without a credential and the task idles until one is
/// installed again.
pub fn spawn_refresh_task(
    manager: Arc<TokenManager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the credential was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&manager, threshold).await;
        }
    })
}

/// One check-and-maybe-refresh pass.
pub(crate) async fn refresh_cycle(manager: &TokenManager, threshold: Duration) {
    let credential = match manager.state().await {
        TokenState::NoCredential | TokenState::Refreshing(_) => return,
        TokenState::Valid(c) | TokenState::Stale(c) => c,
    };

    if credential.refresh_token().is_none() {
        debug!("credential has no refresh token, skipping proactive refresh");
        return;
    }
    if !manager.expires_within(threshold).await {
        return;
    }

    debug!("credential expiring within threshold, refreshing");
    match manager.refresh().await {
        Ok(_) => info!("background token refresh succeeded"),
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "background refresh failed (transient), will retry next cycle");
        }
        Err(e) => warn!(error = %e, kind = e.kind(), "background refresh rejected"),
    }
}
