//! Client-side session state machine.
//!
//! ```text
//!   Anonymous ──login/silent_auth──▶ Authenticating ──▶ Authenticated ◀──┐
//!       ▲  ▲                              │                  │          │
//!       │  └──── silent failure ──────────┤               refresh       │
//!       │                                 ▼                  ▼          │
//!       │                            LoginFailed ◀──fail── Refreshing ──┘
//!       └──────────── logout (from any state) ──────────────────
//! ```
//!
//! Every transition into `Authenticating`/`Refreshing` takes a new epoch. A
//! flow applies its result only while its epoch is current, so a cancelled or
//! superseded flow can never overwrite newer state.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::claims::{Claim, UserClaims};
use crate::error::{AuthError, Rejection};
use crate::provider::{AuthorizeRequest, IdentityProvider, TokenResponse};
use crate::token_cache::{AccessToken, AccessTokenCache, DEFAULT_TOKEN_MARGIN};
use crate::token_store::CredentialStore;

/// Default bound on silent re-authentication and on refresh.
pub const DEFAULT_SILENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lead time before expiry at which auto-refresh fires.
pub const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(60);

pub const DEFAULT_SCOPE: &str = "openid profile email offline_access";

const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated(Arc<UserClaims>),
    Refreshing,
    LoginFailed(AuthError),
}

impl SessionState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticating => "authenticating",
            Self::Authenticated(_) => "authenticated",
            Self::Refreshing => "refreshing",
            Self::LoginFailed(_) => "login failed",
        }
    }

    #[must_use]
    pub const fn user(&self) -> Option<&Arc<UserClaims>> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    const fn can_start_login(&self) -> bool {
        matches!(self, Self::Anonymous | Self::LoginFailed(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// API audience requested at login and used for the default access token.
    pub audience: String,
    pub scope: String,
    pub login_hint: Option<String>,
    pub extra_params: Vec<(String, String)>,
    pub token_margin: Duration,
    /// How long before expiry auto-refresh fires, capped at half the
    /// token's lifetime.
    pub refresh_lead: Duration,
    pub silent_timeout: Duration,
    pub refresh_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            audience: String::new(),
            scope: DEFAULT_SCOPE.into(),
            login_hint: None,
            extra_params: Vec::new(),
            token_margin: DEFAULT_TOKEN_MARGIN,
            refresh_lead: DEFAULT_REFRESH_LEAD,
            silent_timeout: DEFAULT_SILENT_TIMEOUT,
            refresh_timeout: DEFAULT_SILENT_TIMEOUT,
        }
    }
}

/// Mutable session data, always changed together with the published state.
#[derive(Default)]
struct Flow {
    epoch: u64,
    cancel: Option<CancellationToken>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    issued_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl Flow {
    fn reset_session(&mut self) {
        self.refresh_token = None;
        self.id_token = None;
        self.issued_at = None;
        self.expires_at = None;
    }
}

/// A started transition, owned by the flow that runs it.
///
/// Dropped without reaching `complete` (the caller dropped the future), it
/// publishes `abandoned` if its epoch is still current.
struct Transition<P> {
    shared: Arc<Shared<P>>,
    epoch: u64,
    cancel: CancellationToken,
    refresh_token: Option<String>,
    user: Option<Arc<UserClaims>>,
    abandoned: Option<SessionState>,
}

impl<P> Drop for Transition<P> {
    fn drop(&mut self) {
        let Some(state) = self.abandoned.take() else {
            return;
        };
        let mut flow = self.shared.flow.lock().unwrap_or_else(PoisonError::into_inner);
        if flow.epoch != self.epoch {
            return;
        }
        flow.epoch += 1;
        flow.cancel = None;
        self.cancel.cancel();
        flow.reset_session();
        self.shared.tokens.clear();
        tracing::info!(epoch = self.epoch, next = state.name(), "flow abandoned by caller");
        self.shared.state.send_replace(state);
    }
}

/// Outcome of a successful token response, applied in one step.
struct Established {
    user: Arc<UserClaims>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    issued_at: DateTime<Utc>,
    access: AccessToken,
}

struct Shared<P> {
    provider: Arc<P>,
    store: Arc<dyn CredentialStore>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    tokens: AccessTokenCache<P>,
    flow: Mutex<Flow>,
    shutdown: CancellationToken,
}

/// Owns the login lifecycle: `new` → active → [`dispose`](Self::dispose).
///
/// Cheap to clone; clones share one session.
pub struct AuthSessionManager<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for AuthSessionManager<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: IdentityProvider> AuthSessionManager<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, store: Arc<dyn CredentialStore>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        let tokens = AccessTokenCache::new(Arc::clone(&provider), options.token_margin);
        Self {
            shared: Arc::new(Shared {
                provider,
                store,
                options,
                state,
                tokens,
                flow: Mutex::new(Flow::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Signed-in user, only while `Authenticated`.
    #[must_use]
    pub fn user(&self) -> Option<Arc<UserClaims>> {
        self.shared.state.borrow().user().cloned()
    }

    /// Expiry of the session's current access token.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock_flow().expires_at
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Interactive login.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless `Anonymous` or `LoginFailed`; no flow starts
    /// - the flow's failure, which is also published as `LoginFailed`
    /// - `Superseded`/`Disposed` if a newer transition took over
    pub async fn login(&self) -> Result<Arc<UserClaims>, AuthError> {
        let transition = self.begin(
            "log in",
            SessionState::can_start_login,
            SessionState::Authenticating,
            SessionState::LoginFailed(AuthError::UserCancelled),
        )?;
        tracing::info!(epoch = transition.epoch, "starting interactive login");

        let provider = &self.shared.provider;
        let outcome = bounded(&transition.cancel, None, async {
            let request = self.authorize_request();
            let grant = provider
                .authorize_interactive(&request, transition.cancel.clone())
                .await?;
            let issued_at = Utc::now();
            let tokens = provider.exchange_code(&grant).await?;
            self.establish(tokens, issued_at, None).await
        })
        .await;

        self.complete(transition, outcome, SessionState::LoginFailed)
    }

    /// Cancel an in-flight login. The state becomes `LoginFailed(UserCancelled)`
    /// immediately. Returns whether anything was cancelled.
    pub fn cancel_login(&self) -> bool {
        let mut flow = self.lock_flow();
        let cancelled = self.shared.state.send_if_modified(|state| {
            if matches!(state, SessionState::Authenticating) {
                *state = SessionState::LoginFailed(AuthError::UserCancelled);
                true
            } else {
                false
            }
        });
        if cancelled {
            flow.epoch += 1;
            if let Some(cancel) = flow.cancel.take() {
                cancel.cancel();
            }
            tracing::info!("login cancelled");
        }
        cancelled
    }

    /// Re-authenticate from the stored refresh credential without user
    /// interaction. Any failure returns the session to `Anonymous`.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless `Anonymous` or `LoginFailed`
    /// - `NotAuthenticated` if no credential is stored
    /// - `TimedOut` past the silent timeout
    /// - the provider's rejection; an invalid grant also deletes the credential
    pub async fn silent_auth(&self) -> Result<Arc<UserClaims>, AuthError> {
        let transition = self.begin(
            "authenticate silently",
            SessionState::can_start_login,
            SessionState::Authenticating,
            SessionState::Anonymous,
        )?;
        let options = &self.shared.options;

        let outcome = bounded(
            &transition.cancel,
            Some(("silent authentication", options.silent_timeout)),
            async {
                let (credential, source) =
                    self.shared.store.load().ok_or(AuthError::NotAuthenticated)?;
                tracing::debug!(source = source.as_str(), "attempting silent authentication");
                let issued_at = Utc::now();
                let mut tokens = self
                    .shared
                    .provider
                    .refresh(&credential, &options.audience, &options.scope)
                    .await?;
                tokens.refresh_token.get_or_insert(credential);
                self.establish(tokens, issued_at, None).await
            },
        )
        .await;

        if let Err(error) = &outcome {
            tracing::debug!(%error, "silent authentication failed");
            if error.is_invalid_grant() {
                self.forget_stored_credential();
            }
        }
        self.complete(transition, outcome, |_| SessionState::Anonymous)
    }

    /// Renew the session's tokens.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless `Authenticated`
    /// - `RefreshFailed` on any failure or timeout; the state becomes
    ///   `LoginFailed(RefreshFailed)` rather than staying stale
    pub async fn refresh(&self) -> Result<Arc<UserClaims>, AuthError> {
        let transition = self.begin(
            "refresh",
            |state| matches!(state, SessionState::Authenticated(_)),
            SessionState::Refreshing,
            SessionState::LoginFailed(AuthError::RefreshFailed("refresh abandoned".into())),
        )?;
        let options = &self.shared.options;

        let outcome = bounded(
            &transition.cancel,
            Some(("token refresh", options.refresh_timeout)),
            async {
                let credential = transition
                    .refresh_token
                    .clone()
                    .ok_or_else(|| AuthError::RefreshFailed("no refresh credential".into()))?;
                let issued_at = Utc::now();
                let mut tokens = self
                    .shared
                    .provider
                    .refresh(&credential, &options.audience, &options.scope)
                    .await?;
                tokens.refresh_token.get_or_insert(credential);
                self.establish(tokens, issued_at, transition.user.clone())
                    .await
            },
        )
        .await;

        if let Err(error) = &outcome
            && error.is_invalid_grant()
        {
            self.forget_stored_credential();
        }
        let outcome = outcome.map_err(|error| match error {
            AuthError::RefreshFailed(_) => error,
            other => AuthError::RefreshFailed(other.to_string()),
        });
        self.complete(transition, outcome, SessionState::LoginFailed)
    }

    /// Return to `Anonymous` from any state. Cancels in-flight flows and
    /// clears claims, cached tokens, and the stored credential before
    /// telling the provider; a provider failure is only logged.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after [`dispose`](Self::dispose).
    pub async fn logout(&self) -> Result<(), AuthError> {
        let id_token_hint = {
            let mut flow = self.lock_flow();
            if self.is_disposed() {
                return Err(AuthError::Disposed);
            }
            flow.epoch += 1;
            if let Some(cancel) = flow.cancel.take() {
                cancel.cancel();
            }
            let hint = flow.id_token.take();
            flow.reset_session();
            self.shared.tokens.clear();
            if let Err(error) = self.shared.store.delete() {
                tracing::warn!(%error, "failed to delete stored credential");
            }
            self.shared.state.send_replace(SessionState::Anonymous);
            hint
        };
        tracing::info!("logged out");

        if let Err(error) = self.shared.provider.end_session(id_token_hint.as_deref()).await {
            tracing::warn!(%error, "provider logout failed");
        }
        Ok(())
    }

    /// Access token for `audience`/`scope`, from cache or renewed.
    ///
    /// # Errors
    ///
    /// - `NotAuthenticated` unless `Authenticated`
    /// - `MissingAudience` for an empty audience
    /// - the provider's error if renewal fails
    ///
    /// A renewal that rotates the refresh credential replaces the session's
    /// copy and the stored one.
    pub async fn access_token(&self, audience: &str, scope: &str) -> Result<AccessToken, AuthError> {
        let (epoch, credential) = {
            let flow = self.lock_flow();
            if self.is_disposed() {
                return Err(AuthError::Disposed);
            }
            if !matches!(*self.shared.state.borrow(), SessionState::Authenticated(_)) {
                return Err(AuthError::NotAuthenticated);
            }
            (flow.epoch, flow.refresh_token.clone())
        };
        let issued = self
            .shared
            .tokens
            .get_token(audience, scope, credential.as_deref())
            .await?;
        if let Some(rotated) = issued.rotated_credential {
            self.adopt_rotated_credential(epoch, credential.as_deref(), rotated);
        }
        Ok(issued.token)
    }

    /// Access token for the configured audience and scope.
    ///
    /// # Errors
    ///
    /// As [`access_token`](Self::access_token).
    pub async fn default_access_token(&self) -> Result<AccessToken, AuthError> {
        let options = &self.shared.options;
        self.access_token(&options.audience, &options.scope).await
    }

    /// Refresh in the background `refresh_lead` before the token expires.
    /// The task ends on [`dispose`](Self::dispose).
    pub fn spawn_auto_refresh(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut changes = self.subscribe();
        tokio::spawn(async move {
            loop {
                let due = manager.refresh_due();
                tokio::select! {
                    () = manager.shared.shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(due.unwrap_or_default()), if due.is_some() => {
                        tracing::debug!("auto-refresh due");
                        if let Err(error) = manager.refresh().await {
                            tracing::warn!(%error, "automatic refresh failed");
                        }
                    }
                }
            }
            tracing::debug!("auto-refresh task stopped");
        })
    }

    /// End the session manager. In-flight flows are cancelled and every
    /// later operation returns `Disposed`. The stored credential is kept.
    pub fn dispose(&self) {
        let mut flow = self.lock_flow();
        if self.is_disposed() {
            return;
        }
        self.shared.shutdown.cancel();
        flow.epoch += 1;
        flow.cancel = None;
        flow.reset_session();
        self.shared.tokens.clear();
        self.shared.state.send_replace(SessionState::Anonymous);
        tracing::debug!("session manager disposed");
    }

    fn lock_flow(&self) -> MutexGuard<'_, Flow> {
        self.shared.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorize_request(&self) -> AuthorizeRequest {
        let options = &self.shared.options;
        AuthorizeRequest {
            audience: options.audience.clone(),
            scope: options.scope.clone(),
            login_hint: options.login_hint.clone(),
            extra_params: options.extra_params.clone(),
        }
    }

    /// Check-and-set into a transient state under the flow lock.
    fn begin(
        &self,
        operation: &'static str,
        allowed: impl FnOnce(&SessionState) -> bool,
        next: SessionState,
        abandoned: SessionState,
    ) -> Result<Transition<P>, AuthError> {
        let mut flow = self.lock_flow();
        if self.is_disposed() {
            return Err(AuthError::Disposed);
        }

        let mut rejected = None;
        let mut user = None;
        self.shared.state.send_if_modified(|state| {
            if allowed(state) {
                user = state.user().cloned();
                *state = next;
                true
            } else {
                rejected = Some(state.name());
                false
            }
        });
        if let Some(state) = rejected {
            return Err(AuthError::InvalidTransition { operation, state });
        }

        flow.epoch += 1;
        if let Some(previous) = flow.cancel.take() {
            previous.cancel();
        }
        let cancel = self.shared.shutdown.child_token();
        flow.cancel = Some(cancel.clone());

        Ok(Transition {
            shared: Arc::clone(&self.shared),
            epoch: flow.epoch,
            cancel,
            refresh_token: flow.refresh_token.clone(),
            user,
            abandoned: Some(abandoned),
        })
    }

    /// Apply a flow's outcome if its epoch is still current.
    fn complete(
        &self,
        mut transition: Transition<P>,
        outcome: Result<Established, AuthError>,
        on_error: impl FnOnce(AuthError) -> SessionState,
    ) -> Result<Arc<UserClaims>, AuthError> {
        transition.abandoned = None;
        let mut flow = self.lock_flow();
        if flow.epoch != transition.epoch {
            tracing::debug!(epoch = transition.epoch, "discarding superseded flow result");
            return Err(match outcome {
                _ if self.is_disposed() => AuthError::Disposed,
                Err(AuthError::UserCancelled) => AuthError::UserCancelled,
                _ => AuthError::Superseded,
            });
        }
        flow.cancel = None;

        match outcome {
            Ok(established) => {
                let user = Arc::clone(&established.user);
                if let Some(refresh_token) = established.refresh_token {
                    if let Err(error) = self.shared.store.store(&refresh_token) {
                        tracing::warn!(%error, "failed to persist refresh credential");
                    }
                    flow.refresh_token = Some(refresh_token);
                }
                if established.id_token.is_some() {
                    flow.id_token = established.id_token;
                }
                flow.issued_at = Some(established.issued_at);
                flow.expires_at = Some(established.access.expires_at);
                if !established.access.audience.is_empty() {
                    self.shared.tokens.seed(established.access);
                }
                self.shared
                    .state
                    .send_replace(SessionState::Authenticated(Arc::clone(&user)));
                tracing::info!(sub = %user.sub, "session authenticated");
                Ok(user)
            }
            Err(error) => {
                flow.reset_session();
                self.shared.tokens.clear();
                self.shared.state.send_replace(on_error(error.clone()));
                Err(error)
            }
        }
    }

    async fn establish(
        &self,
        tokens: TokenResponse,
        issued_at: DateTime<Utc>,
        previous_user: Option<Arc<UserClaims>>,
    ) -> Result<Established, AuthError> {
        let user = match (&tokens.id_token, previous_user) {
            (Some(id_token), previous) => {
                let user = self.shared.provider.validate_id_token(id_token).await?;
                if previous.is_some_and(|p| p.sub != user.sub) {
                    return Err(AuthError::InvalidIdToken(Rejection::ClaimInvalid(
                        Claim::Subject,
                    )));
                }
                Arc::new(user)
            }
            (None, Some(previous)) => previous,
            (None, None) => {
                return Err(AuthError::InvalidIdToken(Rejection::Malformed(
                    "token response has no id_token",
                )));
            }
        };

        let options = &self.shared.options;
        let access = AccessToken::from_response(&tokens, &options.audience, &options.scope, issued_at);
        Ok(Established {
            user,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
            issued_at,
            access,
        })
    }

    /// Replace the session credential with one rotated by an access-token
    /// renewal, unless the session moved on while the renewal ran.
    fn adopt_rotated_credential(&self, epoch: u64, used: Option<&str>, rotated: String) {
        let mut flow = self.lock_flow();
        if flow.epoch != epoch || flow.refresh_token.as_deref() != used {
            tracing::debug!("session changed during renewal; discarding rotated credential");
            return;
        }
        if let Err(error) = self.shared.store.store(&rotated) {
            tracing::warn!(%error, "failed to persist refresh credential");
        }
        flow.refresh_token = Some(rotated);
        tracing::debug!("refresh credential rotated by access-token renewal");
    }

    fn forget_stored_credential(&self) {
        tracing::info!("provider rejected stored credential; deleting it");
        if let Err(error) = self.shared.store.delete() {
            tracing::warn!(%error, "failed to delete stored credential");
        }
    }

    /// Time until auto-refresh should fire, while `Authenticated`.
    fn refresh_due(&self) -> Option<Duration> {
        let flow = self.lock_flow();
        if !matches!(*self.shared.state.borrow(), SessionState::Authenticated(_)) {
            return None;
        }
        let expires_at = flow.expires_at?;
        let lifetime = flow.issued_at.map_or(TimeDelta::MAX, |at| expires_at - at);
        let lead = TimeDelta::from_std(self.shared.options.refresh_lead)
            .unwrap_or(TimeDelta::MAX)
            .min(lifetime / 2);
        let until = expires_at
            .checked_sub_signed(lead)
            .map_or(Duration::ZERO, |at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        Some(until.max(MIN_REFRESH_DELAY))
    }
}

/// Run `work` until it finishes, `cancel` fires, or `limit` elapses.
async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Option<(&'static str, Duration)>,
    work: impl Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    let cancellable = async {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AuthError::UserCancelled),
            result = work => result,
        }
    };
    match limit {
        None => cancellable.await,
        Some((operation, limit)) => tokio::time::timeout(limit, cancellable)
            .await
            .unwrap_or(Err(AuthError::TimedOut {
                operation,
                secs: limit.as_secs(),
            })),
    }
}
