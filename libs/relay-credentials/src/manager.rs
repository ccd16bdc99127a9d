use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::SecretString;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CredentialConfig;
use crate::credential::Credential;
use crate::error::CredentialError;
use crate::identity::{HttpIdentityClient, IdentityClient};

/// Observable lifecycle state of the stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No credential has been obtained yet.
    Unauthenticated,
    /// A credential is held and outside the renewal window.
    Authenticated,
    /// A credential is held but expires within the renewal threshold.
    NearExpiry,
    /// The held credential has expired.
    Expired,
}

/// When the background loop looks at the credential and how early it renews.
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&CredentialConfig> for RenewalPolicy {
    fn from(cfg: &CredentialConfig) -> Self {
        Self {
            interval: cfg.renewal_interval,
            threshold: cfg.renewal_threshold,
        }
    }
}

/// Owns the bearer credential for this deployment.
///
/// Reads and writes of the stored [`Credential`] happen under one short-lived
/// lock; identity calls are made with the lock released and only the final
/// replacement is done under it. A failed login or refresh never touches the
/// stored value.
///
/// Share it as `Arc<CredentialManager>`; the renewal loop holds its own clone.
pub struct CredentialManager {
    identity: Arc<dyn IdentityClient>,
    current: Mutex<Option<Credential>>,
    // One renewal at a time; waiters re-read `current` once they get in.
    renew_gate: tokio::sync::Mutex<()>,
    policy: RenewalPolicy,
    shutdown: CancellationToken,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Create a manager backed by the HTTP identity service.
    ///
    /// No network call is made; the manager starts `Unauthenticated`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if the config is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: &CredentialConfig) -> Result<Self, CredentialError> {
        config.validate()?;
        let identity = HttpIdentityClient::new(config)?;
        Ok(Self::with_identity(
            Arc::new(identity),
            RenewalPolicy::from(config),
        ))
    }

    /// Create a manager over any [`IdentityClient`].
    #[must_use]
    pub fn with_identity(identity: Arc<dyn IdentityClient>, policy: RenewalPolicy) -> Self {
        Self {
            identity,
            current: Mutex::new(None),
            renew_gate: tokio::sync::Mutex::new(()),
            policy,
            shutdown: CancellationToken::new(),
            renewal_task: Mutex::new(None),
        }
    }

    /// Build a manager, attempt the first login, and start background renewal.
    ///
    /// A failed first login is logged, not returned: the next
    /// [`token`](Self::token) call or renewal tick tries again.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if the config is invalid.
    pub async fn start(config: &CredentialConfig) -> Result<Arc<Self>, CredentialError> {
        let manager = Arc::new(Self::new(config)?);
        if let Err(e) = manager.login().await {
            tracing::warn!(error = %e, "initial login failed; will retry on demand");
        }
        manager.spawn_renewal();
        Ok(manager)
    }

    /// Authenticate and replace the stored credential.
    ///
    /// # Errors
    ///
    /// Returns the identity error; the stored credential is left unchanged.
    pub async fn login(&self) -> Result<(), CredentialError> {
        self.login_credential().await.map(drop)
    }

    /// Exchange the held refresh token and replace the stored credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Refresh`] if no refresh token is held or the
    /// exchange fails; the stored credential is left unchanged.
    pub async fn refresh(&self) -> Result<(), CredentialError> {
        self.refresh_credential().await.map(drop)
    }

    /// Return an access token that has not expired at hand-off.
    ///
    /// A cached, unexpired token is returned without any network call.
    /// Otherwise one refresh is attempted, then one login if that fails.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Renewal`] carrying both causes when refresh
    /// and login both fail. Nothing is stored in that case.
    pub async fn token(&self) -> Result<SecretString, CredentialError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let _gate = self.renew_gate.lock().await;
        if let Some(token) = self.cached_token() {
            tracing::debug!("access token renewed by a concurrent caller");
            return Ok(token);
        }

        tracing::info!("access token expired or missing, renewing");
        let credential = self.renew().await?;
        Ok(credential.access_token().clone())
    }

    /// Copy of the stored credential, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Credential> {
        self.current.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> CredentialState {
        self.state_at(OffsetDateTime::now_utc())
    }

    fn state_at(&self, now: OffsetDateTime) -> CredentialState {
        let remaining = match self.current.lock().as_ref() {
            None => return CredentialState::Unauthenticated,
            Some(c) => c.remaining_at(now),
        };
        if remaining <= time::Duration::ZERO {
            CredentialState::Expired
        } else if remaining < self.policy.threshold {
            CredentialState::NearExpiry
        } else {
            CredentialState::Authenticated
        }
    }

    /// Spawn the renewal loop on the current runtime.
    ///
    /// Calling it again while a loop is registered is a no-op.
    pub fn spawn_renewal(self: &Arc<Self>) {
        let mut slot = self.renewal_task.lock();
        if slot.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(run_renewal_task(Arc::clone(self), self.shutdown.clone()));
        *slot = Some(handle);
    }

    /// Signal the renewal loop to stop. Idempotent; the stored credential is kept.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop the renewal loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.renewal_task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "credential renewal task ended abnormally");
        }
    }

    async fn login_credential(&self) -> Result<Credential, CredentialError> {
        let credential = self.identity.login().await?;
        self.store(credential.clone());
        tracing::info!(client_id = credential.client_id(), "successfully authenticated");
        Ok(credential)
    }

    async fn refresh_credential(&self) -> Result<Credential, CredentialError> {
        let refresh_token = self
            .current
            .lock()
            .as_ref()
            .map(|c| c.refresh_token().clone())
            .ok_or_else(|| CredentialError::Refresh("no refresh token available".into()))?;

        let credential = self.identity.refresh(&refresh_token).await?;
        self.store(credential.clone());
        tracing::info!(client_id = credential.client_id(), "access token refreshed");
        Ok(credential)
    }

    /// Refresh, falling back to one login.
    async fn renew(&self) -> Result<Credential, CredentialError> {
        let refresh_err = match self.refresh_credential().await {
            Ok(credential) => return Ok(credential),
            Err(e) => e,
        };
        tracing::warn!(error = %refresh_err, "token refresh failed, logging in again");

        self.login_credential()
            .await
            .map_err(|login_err| CredentialError::renewal(refresh_err, login_err))
    }

    fn cached_token(&self) -> Option<SecretString> {
        let now = OffsetDateTime::now_utc();
        self.current
            .lock()
            .as_ref()
            .filter(|c| !c.is_expired_at(now))
            .map(|c| c.access_token().clone())
    }

    async fn renew_if_near_expiry(&self) {
        let _gate = self.renew_gate.lock().await;
        let now = OffsetDateTime::now_utc();
        match self.state_at(now) {
            CredentialState::Authenticated => return,
            state => tracing::info!(?state, "token nearing expiration, renewing"),
        }
        if let Err(e) = self.renew().await {
            tracing::error!(error = %e, "background token renewal failed; retrying next tick");
        }
    }

    fn store(&self, credential: Credential) {
        *self.current.lock() = Some(credential);
    }
}

/// Periodically renew the credential until `cancel` fires.
///
/// The first check happens one interval after start.
async fn run_renewal_task(manager: Arc<CredentialManager>, cancel: CancellationToken) {
    let period = manager.policy.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("stopping credential renewal");
                break;
            }
            _ = ticker.tick() => {
                manager.renew_if_near_expiry().await;
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::credential::token_expiry;
    use async_trait::async_trait;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use secrecy::ExposeSecret;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

    /// Identity double that mints JWTs with a configurable lifetime.
    struct ScriptedIdentity {
        login_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        login_ok: AtomicBool,
        refresh_ok: AtomicBool,
        lifetime_secs: AtomicI64,
        minted: AtomicUsize,
        latency_ms: AtomicU64,
    }

    impl ScriptedIdentity {
        fn new(lifetime_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                login_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                login_ok: AtomicBool::new(true),
                refresh_ok: AtomicBool::new(true),
                lifetime_secs: AtomicI64::new(lifetime_secs),
                minted: AtomicUsize::new(0),
                latency_ms: AtomicU64::new(0),
            })
        }

        fn mint(&self) -> Credential {
            let n = self.minted.fetch_add(1, Ordering::SeqCst);
            let exp = OffsetDateTime::now_utc().unix_timestamp()
                + self.lifetime_secs.load(Ordering::SeqCst);
            let token = encode(
                &Header::default(),
                &json!({ "exp": exp, "jti": n }),
                &EncodingKey::from_secret(b"test"),
            )
            .unwrap();
            Credential::issue(token, format!("refresh-{n}"), 2).unwrap()
        }

        async fn respond(&self) {
            let ms = self.latency_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }

        fn logins(&self) -> usize {
            self.login_calls.load(Ordering::SeqCst)
        }

        fn refreshes(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityClient for ScriptedIdentity {
        async fn login(&self) -> Result<Credential, CredentialError> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            self.respond().await;
            if self.login_ok.load(Ordering::SeqCst) {
                Ok(self.mint())
            } else {
                Err(CredentialError::Authentication("rejected".into()))
            }
        }

        async fn refresh(&self, _token: &SecretString) -> Result<Credential, CredentialError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.respond().await;
            if self.refresh_ok.load(Ordering::SeqCst) {
                Ok(self.mint())
            } else {
                Err(CredentialError::Refresh("refresh token revoked".into()))
            }
        }
    }

    fn manager(identity: &Arc<ScriptedIdentity>) -> Arc<CredentialManager> {
        let identity: Arc<dyn IdentityClient> = identity.clone();
        Arc::new(CredentialManager::with_identity(
            identity,
            RenewalPolicy::default(),
        ))
    }

    fn token_of(manager: &CredentialManager) -> String {
        manager
            .snapshot()
            .unwrap()
            .access_token()
            .expose_secret()
            .to_owned()
    }

    // -- token ----------------------------------------------------------------

    #[tokio::test]
    async fn unexpired_token_is_served_from_cache() {
        let identity = ScriptedIdentity::new(3600);
        let manager = manager(&identity);
        manager.login().await.unwrap();

        let first = manager.token().await.unwrap();
        let second = manager.token().await.unwrap();

        assert_eq!(first.expose_secret(), second.expose_secret());
        assert_eq!(identity.logins(), 1);
        assert_eq!(identity.refreshes(), 0);
    }

    #[tokio::test]
    async fn expired_token_triggers_one_refresh() {
        let identity = ScriptedIdentity::new(-60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        assert_eq!(manager.state(), CredentialState::Expired);

        identity.lifetime_secs.store(3600, Ordering::SeqCst);
        let token = manager.token().await.unwrap();

        assert_eq!(identity.refreshes(), 1);
        assert_eq!(identity.logins(), 1, "no login when refresh succeeds");
        assert_eq!(token.expose_secret(), token_of(&manager));
        assert_eq!(manager.state(), CredentialState::Authenticated);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_one_login() {
        let identity = ScriptedIdentity::new(-60);
        let manager = manager(&identity);
        manager.login().await.unwrap();

        identity.refresh_ok.store(false, Ordering::SeqCst);
        identity.lifetime_secs.store(3600, Ordering::SeqCst);
        let token = manager.token().await.unwrap();

        assert_eq!(identity.refreshes(), 1);
        assert_eq!(identity.logins(), 2);

        let snap = manager.snapshot().unwrap();
        assert_eq!(token.expose_secret(), snap.access_token().expose_secret());
        assert_eq!(
            token_expiry(snap.access_token().expose_secret()).unwrap(),
            snap.expires_at(),
            "stored token and expiry must belong together"
        );
    }

    #[tokio::test]
    async fn failed_renewal_leaves_store_untouched() {
        let identity = ScriptedIdentity::new(-60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        let before = token_of(&manager);

        identity.refresh_ok.store(false, Ordering::SeqCst);
        identity.login_ok.store(false, Ordering::SeqCst);
        let err = manager.token().await.unwrap_err();

        assert!(
            matches!(err, CredentialError::Renewal { .. }),
            "expected combined error, got: {err}"
        );
        assert_eq!(identity.refreshes(), 1);
        assert_eq!(identity.logins(), 2);
        assert_eq!(token_of(&manager), before);
    }

    #[tokio::test]
    async fn first_token_call_logs_in_when_unauthenticated() {
        let identity = ScriptedIdentity::new(3600);
        let manager = manager(&identity);
        assert_eq!(manager.state(), CredentialState::Unauthenticated);

        manager.token().await.unwrap();

        // refresh is attempted first but short-circuits without a network call
        assert_eq!(identity.refreshes(), 0);
        assert_eq!(identity.logins(), 1);
    }

    #[tokio::test]
    async fn refresh_without_credential_is_refresh_error() {
        let identity = ScriptedIdentity::new(3600);
        let manager = manager(&identity);

        let err = manager.refresh().await.unwrap_err();
        assert!(
            matches!(err, CredentialError::Refresh(ref msg) if msg.contains("no refresh token")),
            "got: {err}"
        );
        assert_eq!(identity.refreshes(), 0);
        assert!(manager.snapshot().is_none());
    }

    #[tokio::test]
    async fn failed_login_keeps_unauthenticated_state() {
        let identity = ScriptedIdentity::new(3600);
        identity.login_ok.store(false, Ordering::SeqCst);
        let manager = manager(&identity);

        assert!(manager.login().await.is_err());
        assert_eq!(manager.state(), CredentialState::Unauthenticated);
    }

    // -- concurrency ----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_never_see_mismatched_credentials() {
        let identity = ScriptedIdentity::new(3600);
        let manager = manager(&identity);
        manager.login().await.unwrap();

        let writer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..50 {
                    manager.refresh().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let token = manager.token().await.unwrap();
                        assert!(!token.expose_secret().is_empty());

                        let snap = manager.snapshot().unwrap();
                        assert_eq!(
                            token_expiry(snap.access_token().expose_secret()).unwrap(),
                            snap.expires_at()
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(identity.logins(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_expired_callers_share_one_renewal() {
        let identity = ScriptedIdentity::new(-60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        identity.lifetime_secs.store(3600, Ordering::SeqCst);
        identity.latency_ms.store(50, Ordering::SeqCst);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.token().await.unwrap() })
            })
            .collect();
        let mut tokens = Vec::new();
        for caller in callers {
            tokens.push(caller.await.unwrap().expose_secret().to_owned());
        }

        assert_eq!(identity.refreshes(), 1);
        assert_eq!(identity.logins(), 1, "only the initial login");
        assert!(tokens.iter().all(|t| *t == token_of(&manager)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_after_rotation_failure_log_in_once() {
        let identity = ScriptedIdentity::new(-60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        identity.lifetime_secs.store(3600, Ordering::SeqCst);
        identity.refresh_ok.store(false, Ordering::SeqCst);
        identity.latency_ms.store(50, Ordering::SeqCst);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.token().await.unwrap() })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }

        assert_eq!(identity.refreshes(), 1);
        assert_eq!(identity.logins(), 2, "initial login plus one fallback");
    }

    // -- renewal loop ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_refreshes_near_expiry() {
        let identity = ScriptedIdentity::new(4 * 60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        assert_eq!(manager.state(), CredentialState::NearExpiry);

        manager.spawn_renewal();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(identity.refreshes(), 0, "first tick is one interval after start");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(identity.refreshes(), 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_skips_fresh_credentials() {
        let identity = ScriptedIdentity::new(3600);
        let manager = manager(&identity);
        manager.login().await.unwrap();

        manager.spawn_renewal();
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;

        assert_eq!(identity.refreshes(), 0);
        assert_eq!(identity.logins(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_falls_back_to_login_and_survives_failures() {
        let identity = ScriptedIdentity::new(60);
        identity.refresh_ok.store(false, Ordering::SeqCst);
        identity.login_ok.store(false, Ordering::SeqCst);
        let manager = manager(&identity);

        manager.spawn_renewal();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(identity.logins(), 1, "unauthenticated tick falls through to login");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(identity.logins(), 2, "loop keeps running after failures");

        identity.login_ok.store(true, Ordering::SeqCst);
        identity.lifetime_secs.store(3600, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.state(), CredentialState::Authenticated);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_keeps_credential() {
        let identity = ScriptedIdentity::new(60);
        let manager = manager(&identity);
        manager.login().await.unwrap();
        let before = token_of(&manager);

        manager.spawn_renewal();
        manager.stop();
        manager.stop();
        manager.shutdown().await;

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(identity.refreshes(), 0);
        assert_eq!(token_of(&manager), before);

        manager.spawn_renewal();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(identity.refreshes(), 0, "a stopped manager does not restart renewal");
    }
}
