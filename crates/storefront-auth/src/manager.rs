//! Credential lifecycle state machine
//!
//! The manager owns the one authoritative credential and moves it through:
//!
//! - `NoCredential` → `Valid` (acquire)
//! - `Valid` → `Stale` (clock passes expiry minus skew; recomputed on read)
//! - `Valid`/`Stale` → `Refreshing` → `Valid` (refresh success)
//! - `Refreshing` → `NoCredential` (refresh rejected or malformed)
//! - `Refreshing` → `Valid`/`Stale` (transport or 5xx failure, credential kept)
//! - any → `NoCredential` (invalidate, or a `Rejected` classification)
//!
//! Refresh is single-flight: the exchange runs in a spawned task and its
//! outcome is published once on a `watch` channel that every concurrent
//! caller waits on. A caller that stops waiting does not affect the exchange
//! or the other waiters.
//!
//! State lives behind a tokio Mutex that is never held across a network call.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::classify::CredentialVerdict;
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::credential::Credential;
use crate::error::{AuthError, Result};
use crate::grant::{ClientIdentity, CodeExchange, GrantType, acquire_form, refresh_form};
use crate::metrics;
use crate::shadow::ShadowWriter;
use crate::store::SecretStore;
use crate::token::exchange;
use crate::transport::Transport;

/// Observable state of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    NoCredential,
    Valid(Credential),
    Stale(Credential),
    Refreshing(Credential),
}

impl TokenState {
    pub fn label(&self) -> &'static str {
        match self {
            TokenState::NoCredential => "no_credential",
            TokenState::Valid(_) => "valid",
            TokenState::Stale(_) => "stale",
            TokenState::Refreshing(_) => "refreshing",
        }
    }
}

type Outcome = Option<Result<Credential>>;

enum Phase {
    Empty,
    /// Valid or stale depending on the clock
    Holding(Credential),
    Refreshing {
        current: Credential,
        pending: watch::Receiver<Outcome>,
    },
}

struct Slot {
    phase: Phase,
    /// Bumped on every replacement or invalidation. A refresh that finishes
    /// under a different generation was superseded.
    generation: u64,
    /// Remembered from the last acquire or `remember_identity` for refresh
    /// exchanges. Never persisted.
    client_secret: Option<Secret<String>>,
}

struct Shared {
    config: AuthConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    shadow: ShadowWriter,
    slot: Mutex<Slot>,
}

/// Owns the current credential and all expiry/refresh policy.
///
/// Construct once per client identity and share via `Arc`.
pub struct TokenManager {
    shared: Arc<Shared>,
}

impl TokenManager {
    /// Build a manager, deriving the initial state from the persisted shadow.
    ///
    /// An unreadable store or corrupt shadow starts the manager without a
    /// credential; a corrupt shadow is also deleted.
    pub async fn load(
        config: AuthConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut corrupt = false;
        let initial = match store.get(&config.shadow_key).await {
            Ok(Some(bytes)) => match Credential::from_shadow(&bytes) {
                Ok(credential) => Some(credential),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable credential shadow");
                    corrupt = true;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "secret store unavailable, starting without a credential");
                None
            }
        };

        let shadow = ShadowWriter::spawn(store, config.shadow_key.clone());
        if corrupt {
            shadow.delete();
        }

        let phase = match initial {
            Some(credential) => {
                let stale = config.expiry.is_stale(&credential, clock.now_millis());
                info!(
                    state = if stale { "stale" } else { "valid" },
                    has_refresh_token = credential.refresh_token().is_some(),
                    "loaded persisted credential"
                );
                Phase::Holding(credential)
            }
            None => {
                info!("no persisted credential");
                Phase::Empty
            }
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                clock,
                shadow,
                slot: Mutex::new(Slot {
                    phase,
                    generation: 0,
                    client_secret: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.shared.config
    }

    /// Supply the client secret for refresh exchanges without acquiring.
    ///
    /// A credential loaded from the shadow carries its `client_id` but not
    /// the secret. The secret is ignored when the current credential belongs
    /// to a different client.
    pub async fn remember_identity(&self, identity: &ClientIdentity) {
        let mut slot = self.shared.slot.lock().await;
        let owner = match &slot.phase {
            Phase::Holding(c) | Phase::Refreshing { current: c, .. } => c.client_id(),
            Phase::Empty => None,
        };
        if owner.is_some_and(|id| id != identity.client_id) {
            warn!(
                client_id = %identity.client_id,
                "identity does not match the stored credential, not remembering its secret"
            );
            return;
        }
        slot.client_secret = identity.client_secret.clone();
    }

    /// Snapshot of the current state, with staleness computed now.
    pub async fn state(&self) -> TokenState {
        let slot = self.shared.slot.lock().await;
        match &slot.phase {
            Phase::Empty => TokenState::NoCredential,
            Phase::Holding(c) if self.shared.is_stale(c) => TokenState::Stale(c.clone()),
            Phase::Holding(c) => TokenState::Valid(c.clone()),
            Phase::Refreshing { current, .. } => TokenState::Refreshing(current.clone()),
        }
    }

    /// Exchange client identity for a credential using the configured grant.
    ///
    /// On success the new credential replaces any previous one and is
    /// persisted. On failure the state is unchanged.
    pub async fn acquire(&self, identity: &ClientIdentity) -> Result<Credential> {
        let grant = self.shared.config.grant_type;
        if grant == GrantType::AuthorizationCode {
            return Err(AuthError::InvalidRequest(
                "authorization_code grant needs code material, use acquire_with_code".into(),
            ));
        }
        self.shared.acquire(grant, identity, None).await
    }

    /// Exchange an authorization code (and optional PKCE verifier).
    pub async fn acquire_with_code(
        &self,
        identity: &ClientIdentity,
        code: &CodeExchange,
    ) -> Result<Credential> {
        if code.code.trim().is_empty() {
            return Err(AuthError::InvalidRequest(
                "authorization code must not be empty".into(),
            ));
        }
        self.shared
            .acquire(GrantType::AuthorizationCode, identity, Some(code))
            .await
    }

    /// Return a credential fit to authorize a request right now.
    ///
    /// Never triggers `acquire`. A stale credential is refreshed when it has
    /// a refresh token and is never returned as-is.
    pub async fn ensure_valid(&self) -> Result<Credential> {
        {
            let slot = self.shared.slot.lock().await;
            match &slot.phase {
                Phase::Empty => return Err(AuthError::NoCredentialAvailable),
                Phase::Holding(c) if !self.shared.is_stale(c) => return Ok(c.clone()),
                Phase::Holding(c) if c.refresh_token().is_none() => {
                    debug!("credential stale without refresh token");
                    return Err(AuthError::ReauthenticationRequired(
                        "credential expired and cannot be refreshed".into(),
                    ));
                }
                Phase::Holding(_) | Phase::Refreshing { .. } => {}
            }
        }

        match self.refresh().await {
            Ok(credential) if self.shared.is_stale(&credential) => {
                Err(AuthError::ReauthenticationRequired(
                    "refreshed credential is already expired".into(),
                ))
            }
            Ok(credential) => Ok(credential),
            Err(AuthError::AuthRejected(message)) => {
                Err(AuthError::ReauthenticationRequired(message))
            }
            Err(e @ AuthError::MalformedResponse(_)) => {
                Err(AuthError::ReauthenticationRequired(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Exchange the refresh token for a new credential.
    ///
    /// Joins the in-flight refresh if there is one.
    pub async fn refresh(&self) -> Result<Credential> {
        let rx = self.begin_refresh().await?;
        wait_for_outcome(rx).await
    }

    async fn begin_refresh(&self) -> Result<watch::Receiver<Outcome>> {
        let mut slot = self.shared.slot.lock().await;

        let current = match &slot.phase {
            Phase::Empty => return Err(AuthError::NoCredentialAvailable),
            Phase::Refreshing { current, pending } => {
                // A dropped sender with no published outcome means the task
                // died; start over instead of waiting forever.
                if pending.has_changed().is_ok() || pending.borrow().is_some() {
                    return Ok(pending.clone());
                }
                warn!("previous refresh ended without a result, restarting");
                current.clone()
            }
            Phase::Holding(c) => c.clone(),
        };

        let Some(refresh_token) = current.refresh_token().map(str::to_owned) else {
            return Err(AuthError::ReauthenticationRequired(
                "no refresh token is available".into(),
            ));
        };

        let (tx, rx) = watch::channel(None);
        let generation = slot.generation;
        let client_secret = slot.client_secret.clone();
        slot.phase = Phase::Refreshing {
            current: current.clone(),
            pending: rx.clone(),
        };
        drop(slot);

        debug!(generation, "starting token refresh");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = shared
                .run_refresh(generation, current, refresh_token, client_secret)
                .await;
            tx.send_replace(Some(outcome));
        });

        Ok(rx)
    }

    /// Drop the credential and its shadow. Idempotent.
    pub async fn invalidate(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.clear(&mut slot, "explicit");
    }

    /// Replace the credential and persist it in one step.
    pub async fn set_credential(&self, credential: Credential) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.install(&mut slot, credential);
    }

    /// Inspect an authorized response for server-side rejection, and drop the
    /// credential if the server says it is no longer valid.
    pub async fn classify(&self, status: u16, body: &str) -> CredentialVerdict {
        self.classify_inner(None, status, body).await
    }

    /// Like `classify`, but only invalidates if `used` is still the current
    /// credential. A late rejection of a replaced token leaves its successor.
    pub async fn classify_for(
        &self,
        used: &Credential,
        status: u16,
        body: &str,
    ) -> CredentialVerdict {
        self.classify_inner(Some(used.access_token()), status, body)
            .await
    }

    async fn classify_inner(
        &self,
        used: Option<&str>,
        status: u16,
        body: &str,
    ) -> CredentialVerdict {
        let verdict = self.shared.config.rejection.classify(status, body);
        if let CredentialVerdict::Rejected(message) = &verdict {
            let mut slot = self.shared.slot.lock().await;
            let applies = match &slot.phase {
                Phase::Holding(c) => used.is_none_or(|token| token == c.access_token()),
                Phase::Empty | Phase::Refreshing { .. } => false,
            };
            if applies {
                warn!(status, message = %message, "server rejected credential, invalidating");
                self.shared.clear(&mut slot, "rejected");
            } else {
                debug!(status, "rejection does not apply to the current credential");
            }
        }
        verdict
    }

    /// Whether the current credential goes stale within `threshold`.
    pub async fn expires_within(&self, threshold: Duration) -> bool {
        self.time_remaining()
            .await
            .is_some_and(|remaining| remaining <= threshold)
    }

    /// Time until the current credential goes stale. `None` without one, or
    /// while refreshing.
    pub async fn time_remaining(&self) -> Option<Duration> {
        let slot = self.shared.slot.lock().await;
        match &slot.phase {
            Phase::Holding(c) => Some(
                self.shared
                    .config
                    .expiry
                    .remaining(c, self.shared.clock.now_millis()),
            ),
            Phase::Empty | Phase::Refreshing { .. } => None,
        }
    }

    /// Wait until queued shadow writes have reached the store.
    pub async fn flush(&self) {
        self.shared.shadow.flush().await;
    }
}

impl Shared {
    fn is_stale(&self, credential: &Credential) -> bool {
        self.config
            .expiry
            .is_stale(credential, self.clock.now_millis())
    }

    async fn acquire(
        &self,
        grant: GrantType,
        identity: &ClientIdentity,
        code: Option<&CodeExchange>,
    ) -> Result<Credential> {
        identity.validate_for(grant)?;
        info!(grant_type = %grant, client_id = %identity.client_id, "acquiring credential");

        let form = acquire_form(grant, identity, code, self.config.scopes.as_deref());
        let outcome = exchange(
            self.transport.as_ref(),
            &self.config.token_url,
            form,
            &self.config.rejection,
        )
        .await
        .and_then(|token| {
            token.into_credential(self.clock.now_millis(), Some(identity.client_id.clone()))
        });

        let credential = match outcome {
            Ok(credential) => credential,
            Err(e) => {
                metrics::record_exchange(grant, e.kind());
                warn!(grant_type = %grant, error = %e, kind = e.kind(), "acquire failed");
                return Err(e);
            }
        };

        let mut slot = self.slot.lock().await;
        slot.client_secret = match grant {
            GrantType::Implicit => None,
            _ => identity.client_secret.clone(),
        };
        self.install(&mut slot, credential.clone());
        drop(slot);

        metrics::record_exchange(grant, "success");
        info!(
            grant_type = %grant,
            expires_in_secs = credential.expires_in().map(|d| d.as_secs()),
            has_refresh_token = credential.refresh_token().is_some(),
            "credential acquired"
        );
        Ok(credential)
    }

    async fn run_refresh(
        &self,
        generation: u64,
        current: Credential,
        refresh_token: String,
        client_secret: Option<Secret<String>>,
    ) -> Result<Credential> {
        let form = refresh_form(&refresh_token, current.client_id(), client_secret.as_ref());
        let result = exchange(
            self.transport.as_ref(),
            &self.config.token_url,
            form,
            &self.config.rejection,
        )
        .await
        .and_then(|token| {
            let client_id = current.client_id().map(str::to_owned);
            token.into_credential(self.clock.now_millis(), client_id)
        })
        .map(|credential| {
            // Server kept the refresh token: carry it into the new credential
            if credential.refresh_token().is_none() {
                credential.with_refresh_token(Some(refresh_token))
            } else {
                credential
            }
        });

        let mut slot = self.slot.lock().await;
        if slot.generation != generation || !matches!(slot.phase, Phase::Refreshing { .. }) {
            debug!("credential replaced during refresh, discarding refresh result");
            return match &slot.phase {
                Phase::Holding(c) | Phase::Refreshing { current: c, .. } => Ok(c.clone()),
                Phase::Empty => Err(AuthError::NoCredentialAvailable),
            };
        }

        match result {
            Ok(credential) => {
                self.install(&mut slot, credential.clone());
                metrics::record_exchange(GrantType::RefreshToken, "success");
                info!(
                    expires_in_secs = credential.expires_in().map(|d| d.as_secs()),
                    "token refresh succeeded"
                );
                Ok(credential)
            }
            Err(e @ (AuthError::Transport(_) | AuthError::UnexpectedStatus { .. })) => {
                slot.phase = Phase::Holding(current);
                metrics::record_exchange(GrantType::RefreshToken, e.kind());
                warn!(error = %e, "token refresh failed (transient), keeping credential");
                Err(e)
            }
            Err(e) => {
                metrics::record_exchange(GrantType::RefreshToken, e.kind());
                warn!(error = %e, kind = e.kind(), "token refresh failed, invalidating credential");
                self.clear(&mut slot, "refresh_failed");
                Err(e)
            }
        }
    }

    fn install(&self, slot: &mut Slot, credential: Credential) {
        self.shadow.write(&credential);
        slot.phase = Phase::Holding(credential);
        slot.generation += 1;
    }

    fn clear(&self, slot: &mut Slot, reason: &'static str) {
        if !matches!(slot.phase, Phase::Empty) {
            metrics::record_invalidation(reason);
            info!(reason, "credential invalidated");
        }
        slot.phase = Phase::Empty;
        slot.generation += 1;
        slot.client_secret = None;
        self.shadow.delete();
    }
}

async fn wait_for_outcome(mut rx: watch::Receiver<Outcome>) -> Result<Credential> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or(Err(AuthError::RefreshInterrupted)),
        Err(_) => Err(AuthError::RefreshInterrupted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemorySecretStore;
    use crate::testing::{FailingStore, ScriptedTransport, token_body};

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        manager: Arc<TokenManager>,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemorySecretStore>,
        clock: Arc<ManualClock>,
    }

    async fn harness_with(config: AuthConfig, transport: ScriptedTransport) -> Harness {
        let transport = Arc::new(transport);
        let store = Arc::new(MemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let manager = TokenManager::load(config, transport.clone(), store.clone(), clock.clone())
            .await
            .unwrap();
        Harness {
            manager: Arc::new(manager),
            transport,
            store,
            clock,
        }
    }

    async fn harness(transport: ScriptedTransport) -> Harness {
        harness_with(config(), transport).await
    }

    fn config() -> AuthConfig {
        AuthConfig::new("https://shop.example/oauth/token").with_expiry_skew(Duration::ZERO)
    }

    fn identity() -> ClientIdentity {
        ClientIdentity::new("storefront-ios", Some(Secret::from("s3cret")))
    }

    async fn shadow(h: &Harness) -> Option<Credential> {
        h.manager.flush().await;
        h.store
            .get(&h.manager.config().shadow_key)
            .await
            .unwrap()
            .map(|bytes| Credential::from_shadow(&bytes).unwrap())
    }

    async fn seed_stale(h: &Harness, refresh_token: Option<&str>) -> Credential {
        let cred = Credential::new("at_old", T0)
            .unwrap()
            .with_refresh_token(refresh_token.map(str::to_owned))
            .with_expires_in(Some(Duration::from_secs(60)))
            .with_client_id(Some("storefront-ios".into()));
        h.manager.set_credential(cred.clone()).await;
        h.clock.advance(Duration::from_secs(61));
        cred
    }

    #[tokio::test]
    async fn acquire_then_ensure_valid_makes_no_network_call() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", Some("rt_1"), 3600))).await;

        let acquired = h.manager.acquire(&identity()).await.unwrap();
        let valid = h.manager.ensure_valid().await.unwrap();

        assert_eq!(valid.access_token(), "at_1");
        assert_eq!(valid, acquired);
        assert_eq!(h.transport.request_count(), 1);
        assert!(matches!(h.manager.state().await, TokenState::Valid(_)));
    }

    #[tokio::test]
    async fn acquire_sends_client_credentials_form() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", None, 3600))).await;
        h.manager.acquire(&identity()).await.unwrap();

        let request = h.transport.request(0);
        assert_eq!(request.url, "https://shop.example/oauth/token");
        assert_eq!(request.form_value("grant_type"), Some("client_credentials"));
        assert_eq!(request.form_value("client_id"), Some("storefront-ios"));
        assert_eq!(request.form_value("client_secret"), Some("s3cret"));
    }

    #[tokio::test]
    async fn acquire_persists_shadow() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", Some("rt_1"), 3600))).await;
        let acquired = h.manager.acquire(&identity()).await.unwrap();
        assert_eq!(shadow(&h).await, Some(acquired));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_and_state_unchanged() {
        let h = harness(
            ScriptedTransport::new().respond(200, r#"{"status":false,"error":"invalid_client"}"#),
        )
        .await;

        let err = h.manager.acquire(&identity()).await.unwrap_err();
        assert_eq!(err, AuthError::AuthRejected("invalid_client".into()));
        assert_eq!(h.manager.state().await, TokenState::NoCredential);
        assert_eq!(shadow(&h).await, None);
    }

    #[tokio::test]
    async fn failed_acquire_keeps_existing_credential() {
        let h = harness(
            ScriptedTransport::new()
                .respond(200, token_body("at_1", None, 3600))
                .respond(200, r#"{"token_type":"Bearer"}"#),
        )
        .await;
        h.manager.acquire(&identity()).await.unwrap();

        let err = h.manager.acquire(&identity()).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
        assert_eq!(h.manager.ensure_valid().await.unwrap().access_token(), "at_1");
    }

    #[tokio::test]
    async fn acquire_transport_error_is_reported() {
        let h = harness(ScriptedTransport::new().fail("connection reset")).await;
        let err = h.manager.acquire(&identity()).await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
        assert!(err.is_retryable());
        assert_eq!(h.manager.state().await, TokenState::NoCredential);
    }

    #[tokio::test]
    async fn acquire_validates_identity_before_sending() {
        let h = harness(ScriptedTransport::new()).await;
        let err = h
            .manager
            .acquire(&ClientIdentity::new("", Some(Secret::from("s"))))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));
        let err = h
            .manager
            .acquire(&ClientIdentity::public("storefront-ios"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn implicit_grant_omits_secret() {
        let h = harness_with(
            config().with_grant_type(GrantType::Implicit),
            ScriptedTransport::new().respond(200, token_body("at_1", None, 3600)),
        )
        .await;
        h.manager.acquire(&identity()).await.unwrap();

        let request = h.transport.request(0);
        assert_eq!(request.form_value("grant_type"), Some("implicit"));
        assert_eq!(request.form_value("client_secret"), None);
    }

    #[tokio::test]
    async fn authorization_code_grant_requires_code_material() {
        let h = harness_with(
            config().with_grant_type(GrantType::AuthorizationCode),
            ScriptedTransport::new().respond(200, token_body("at_1", Some("rt_1"), 3600)),
        )
        .await;
        let public = ClientIdentity::public("storefront-ios");

        let err = h.manager.acquire(&public).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));

        let code = CodeExchange::new("code-123").with_verifier("verifier-abc");
        let cred = h.manager.acquire_with_code(&public, &code).await.unwrap();
        assert_eq!(cred.access_token(), "at_1");

        let request = h.transport.request(0);
        assert_eq!(request.form_value("grant_type"), Some("authorization_code"));
        assert_eq!(request.form_value("code"), Some("code-123"));
        assert_eq!(request.form_value("code_verifier"), Some("verifier-abc"));
    }

    #[tokio::test]
    async fn ensure_valid_without_credential() {
        let h = harness(ScriptedTransport::new()).await;
        assert_eq!(
            h.manager.ensure_valid().await.unwrap_err(),
            AuthError::NoCredentialAvailable
        );
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn expired_credential_triggers_refresh() {
        let h = harness_with(
            AuthConfig::new("https://shop.example/oauth/token"),
            ScriptedTransport::new()
                .respond(200, token_body("at_1", Some("rt_1"), 3600))
                .respond(200, token_body("at_2", Some("rt_2"), 3600)),
        )
        .await;
        h.manager.acquire(&identity()).await.unwrap();

        h.clock.advance(Duration::from_secs(3601));
        assert!(matches!(h.manager.state().await, TokenState::Stale(_)));

        let refreshed = h.manager.ensure_valid().await.unwrap();
        assert_eq!(refreshed.access_token(), "at_2");
        assert_eq!(h.transport.request_count(), 2);

        let request = h.transport.request(1);
        assert_eq!(request.form_value("grant_type"), Some("refresh_token"));
        assert_eq!(request.form_value("refresh_token"), Some("rt_1"));
        assert_eq!(request.form_value("client_id"), Some("storefront-ios"));
        assert_eq!(request.form_value("client_secret"), Some("s3cret"));
        assert_eq!(shadow(&h).await, Some(refreshed));
    }

    #[tokio::test]
    async fn stale_credential_is_never_returned() {
        let h = harness(ScriptedTransport::new()).await;
        let stale = seed_stale(&h, None).await;

        let err = h.manager.ensure_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::ReauthenticationRequired(_)));
        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(h.manager.state().await, TokenState::Stale(stale));
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_server_omits_it() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_new", None, 3600))).await;
        seed_stale(&h, Some("rt_keep")).await;

        let refreshed = h.manager.ensure_valid().await.unwrap();
        assert_eq!(refreshed.access_token(), "at_new");
        assert_eq!(refreshed.refresh_token(), Some("rt_keep"));
        assert_eq!(refreshed.client_id(), Some("storefront-ios"));
    }

    #[tokio::test]
    async fn rejected_refresh_invalidates() {
        let h = harness(
            ScriptedTransport::new()
                .respond(400, r#"{"error":"invalid_grant","error_description":"revoked"}"#),
        )
        .await;
        seed_stale(&h, Some("rt_revoked")).await;

        let err = h.manager.ensure_valid().await.unwrap_err();
        assert_eq!(err, AuthError::ReauthenticationRequired("revoked".into()));
        assert_eq!(h.manager.state().await, TokenState::NoCredential);
        assert_eq!(shadow(&h).await, None);
        assert_eq!(
            h.manager.ensure_valid().await.unwrap_err(),
            AuthError::NoCredentialAvailable
        );
    }

    #[tokio::test]
    async fn malformed_refresh_invalidates() {
        let h = harness(ScriptedTransport::new().respond(200, "not json")).await;
        seed_stale(&h, Some("rt_1")).await;

        let err = h.manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
        assert_eq!(h.manager.state().await, TokenState::NoCredential);
    }

    #[tokio::test]
    async fn transport_failure_during_refresh_keeps_credential() {
        let h = harness(
            ScriptedTransport::new()
                .fail("timed out")
                .respond(200, token_body("at_2", Some("rt_2"), 3600)),
        )
        .await;
        let stale = seed_stale(&h, Some("rt_1")).await;

        let err = h.manager.ensure_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
        assert_eq!(h.manager.state().await, TokenState::Stale(stale));

        // Caller-driven retry succeeds
        assert_eq!(h.manager.ensure_valid().await.unwrap().access_token(), "at_2");
    }

    #[tokio::test]
    async fn server_error_during_refresh_keeps_credential() {
        let h = harness(ScriptedTransport::new().respond(503, "")).await;
        seed_stale(&h, Some("rt_1")).await;

        let err = h.manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::UnexpectedStatus { status: 503, .. }));
        assert!(matches!(h.manager.state().await, TokenState::Stale(_)));
    }

    #[tokio::test]
    async fn refresh_without_credential_or_refresh_token() {
        let h = harness(ScriptedTransport::new()).await;
        assert_eq!(
            h.manager.refresh().await.unwrap_err(),
            AuthError::NoCredentialAvailable
        );
        seed_stale(&h, None).await;
        assert!(matches!(
            h.manager.refresh().await.unwrap_err(),
            AuthError::ReauthenticationRequired(_)
        ));
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn remembered_identity_refreshes_after_restart() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", Some("rt_1"), 60))).await;
        h.manager.acquire(&identity()).await.unwrap();
        h.manager.flush().await;

        let transport = Arc::new(
            ScriptedTransport::new().respond(200, token_body("at_2", Some("rt_2"), 3600)),
        );
        let restarted = TokenManager::load(
            config(),
            transport.clone(),
            h.store.clone(),
            h.clock.clone(),
        )
        .await
        .unwrap();
        restarted.remember_identity(&identity()).await;
        h.clock.advance(Duration::from_secs(61));

        let refreshed = restarted.ensure_valid().await.unwrap();
        assert_eq!(refreshed.access_token(), "at_2");
        let request = transport.request(0);
        assert_eq!(request.form_value("refresh_token"), Some("rt_1"));
        assert_eq!(request.form_value("client_id"), Some("storefront-ios"));
        assert_eq!(request.form_value("client_secret"), Some("s3cret"));
    }

    #[tokio::test]
    async fn identity_of_another_client_is_not_remembered() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_2", None, 3600))).await;
        seed_stale(&h, Some("rt_1")).await;

        h.manager
            .remember_identity(&ClientIdentity::new("other-app", Some(Secret::from("other"))))
            .await;
        h.manager.refresh().await.unwrap();

        let request = h.transport.request(0);
        assert_eq!(request.form_value("client_id"), Some("storefront-ios"));
        assert_eq!(request.form_value("client_secret"), None);
    }

    #[tokio::test]
    async fn ensure_valid_restarts_a_refresh_whose_task_died() {
        let h = harness(
            ScriptedTransport::new()
                .panic()
                .respond(200, token_body("at_2", Some("rt_2"), 3600)),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        assert_eq!(
            h.manager.ensure_valid().await.unwrap_err(),
            AuthError::RefreshInterrupted
        );
        assert!(matches!(h.manager.state().await, TokenState::Refreshing(_)));

        let cred = h.manager.ensure_valid().await.unwrap();
        assert_eq!(cred.access_token(), "at_2");
        assert_eq!(h.transport.request_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_exchange() {
        let h = harness(
            ScriptedTransport::new()
                .with_delay(Duration::from_millis(50))
                .respond(200, token_body("at_shared", Some("rt_2"), 3600)),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    manager.refresh().await
                } else {
                    manager.ensure_valid().await
                }
            }));
        }

        for handle in handles {
            let cred = handle.await.unwrap().unwrap();
            assert_eq!(cred.access_token(), "at_shared");
        }
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_failure() {
        let h = harness(
            ScriptedTransport::new()
                .with_delay(Duration::from_millis(50))
                .respond(200, r#"{"status":false,"error":"refresh token revoked"}"#),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move { manager.refresh().await }));
        }

        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap_err(),
                AuthError::AuthRejected("refresh token revoked".into())
            );
        }
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_refresh() {
        let h = harness(
            ScriptedTransport::new()
                .with_delay(Duration::from_millis(100))
                .respond(200, token_body("at_2", Some("rt_2"), 3600)),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), h.manager.refresh()).await;
        assert!(abandoned.is_err(), "first waiter should time out");
        assert!(matches!(h.manager.state().await, TokenState::Refreshing(_)));

        let cred = h.manager.refresh().await.unwrap();
        assert_eq!(cred.access_token(), "at_2");
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn replacement_during_refresh_wins() {
        let h = harness(
            ScriptedTransport::new()
                .with_delay(Duration::from_millis(50))
                .respond(200, token_body("at_from_refresh", Some("rt_2"), 3600)),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        let manager = h.manager.clone();
        let waiter = tokio::spawn(async move { manager.refresh().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let replacement = Credential::new("at_replacement", h.clock.now_millis())
            .unwrap()
            .with_expires_in(Some(Duration::from_secs(3600)));
        h.manager.set_credential(replacement.clone()).await;

        assert_eq!(waiter.await.unwrap().unwrap(), replacement);
        assert_eq!(h.manager.ensure_valid().await.unwrap(), replacement);
        assert_eq!(shadow(&h).await, Some(replacement));
    }

    #[tokio::test]
    async fn invalidate_during_refresh_discards_result() {
        let h = harness(
            ScriptedTransport::new()
                .with_delay(Duration::from_millis(50))
                .respond(200, token_body("at_2", Some("rt_2"), 3600)),
        )
        .await;
        seed_stale(&h, Some("rt_1")).await;

        let manager = h.manager.clone();
        let waiter = tokio::spawn(async move { manager.refresh().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager.invalidate().await;

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            AuthError::NoCredentialAvailable
        );
        assert_eq!(h.manager.state().await, TokenState::NoCredential);
    }

    #[tokio::test]
    async fn classify_rejection_invalidates() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", None, 3600))).await;
        h.manager.acquire(&identity()).await.unwrap();

        let verdict = h
            .manager
            .classify(200, r#"{"status":false,"error":"Access token is not valid"}"#)
            .await;
        assert_eq!(
            verdict,
            CredentialVerdict::Rejected("Access token is not valid".into())
        );
        assert_eq!(
            h.manager.ensure_valid().await.unwrap_err(),
            AuthError::NoCredentialAvailable
        );
        assert_eq!(shadow(&h).await, None);
    }

    #[tokio::test]
    async fn classify_success_keeps_credential() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", None, 3600))).await;
        h.manager.acquire(&identity()).await.unwrap();

        let verdict = h.manager.classify(200, r#"{"status":true,"products":[]}"#).await;
        assert_eq!(verdict, CredentialVerdict::StillValid);
        assert!(h.manager.ensure_valid().await.is_ok());
    }

    #[tokio::test]
    async fn late_rejection_of_replaced_token_is_ignored() {
        let h = harness(
            ScriptedTransport::new()
                .respond(200, token_body("at_1", None, 3600))
                .respond(200, token_body("at_2", None, 3600)),
        )
        .await;
        let first = h.manager.acquire(&identity()).await.unwrap();
        h.manager.acquire(&identity()).await.unwrap();

        let verdict = h
            .manager
            .classify_for(&first, 401, r#"{"status":false,"error":"expired"}"#)
            .await;
        assert!(matches!(verdict, CredentialVerdict::Rejected(_)));
        assert_eq!(h.manager.ensure_valid().await.unwrap().access_token(), "at_2");
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", None, 3600))).await;
        h.manager.acquire(&identity()).await.unwrap();

        h.manager.invalidate().await;
        let first = h.manager.state().await;
        h.manager.invalidate().await;

        assert_eq!(first, TokenState::NoCredential);
        assert_eq!(h.manager.state().await, first);
        assert_eq!(shadow(&h).await, None);
    }

    #[tokio::test]
    async fn load_derives_initial_state_from_shadow() {
        let store = Arc::new(MemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let cred = Credential::new("at_persisted", T0)
            .unwrap()
            .with_expires_in(Some(Duration::from_secs(600)));
        store
            .set("storefront.credential", cred.to_shadow().unwrap())
            .await
            .unwrap();

        let fresh = load_from(store.clone(), clock.clone()).await;
        assert_eq!(fresh.state().await, TokenState::Valid(cred.clone()));

        clock.advance(Duration::from_secs(601));
        let stale = load_from(store, clock).await;
        assert_eq!(stale.state().await, TokenState::Stale(cred));
    }

    async fn load_from(store: Arc<MemorySecretStore>, clock: Arc<ManualClock>) -> TokenManager {
        TokenManager::load(config(), Arc::new(ScriptedTransport::new()), store, clock)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn load_discards_corrupt_shadow() {
        let store = Arc::new(MemorySecretStore::new());
        store
            .set("storefront.credential", b"{{garbage".to_vec())
            .await
            .unwrap();

        let manager = TokenManager::load(
            config(),
            Arc::new(ScriptedTransport::new()),
            store.clone(),
            Arc::new(ManualClock::new(T0)),
        )
        .await
        .unwrap();

        assert_eq!(manager.state().await, TokenState::NoCredential);
        manager.flush().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_roll_back() {
        let transport = Arc::new(
            ScriptedTransport::new().respond(200, token_body("at_1", None, 3600)),
        );
        let manager = TokenManager::load(
            config(),
            transport,
            Arc::new(FailingStore),
            Arc::new(ManualClock::new(T0)),
        )
        .await
        .unwrap();

        let cred = manager.acquire(&identity()).await.unwrap();
        manager.flush().await;
        assert_eq!(manager.state().await, TokenState::Valid(cred));
    }

    #[tokio::test]
    async fn expires_within_threshold() {
        let h = harness(ScriptedTransport::new().respond(200, token_body("at_1", None, 3600))).await;
        assert!(!h.manager.expires_within(Duration::from_secs(60)).await);

        h.manager.acquire(&identity()).await.unwrap();
        assert!(!h.manager.expires_within(Duration::from_secs(60)).await);
        assert_eq!(
            h.manager.time_remaining().await,
            Some(Duration::from_secs(3600))
        );

        h.clock.advance(Duration::from_secs(3550));
        assert!(h.manager.expires_within(Duration::from_secs(60)).await);
    }

    #[test]
    fn state_labels() {
        assert_eq!(TokenState::NoCredential.label(), "no_credential");
        let cred = Credential::new("a", 0).unwrap();
        assert_eq!(TokenState::Refreshing(cred).label(), "refreshing");
    }
}
