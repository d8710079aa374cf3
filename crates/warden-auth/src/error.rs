use thiserror::Error;

use crate::claims::Claim;

/// Why a signing key could not be resolved from the key-set cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyLookupError {
    #[error("signing key not found in published key set")]
    NotFound,

    #[error("key-set refetch suppressed by rate limit")]
    RateLimited,

    #[error("key-set fetch failed: {0}")]
    FetchFailed(String),

    #[error("key-set fetch timed out")]
    Timeout,
}

/// Reason a bearer token was rejected by the verifier.
///
/// Kept for internal diagnostics only. The HTTP boundary collapses every
/// rejection into [`Unauthenticated`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    #[error("unsupported signing algorithm")]
    UnsupportedAlgorithm,

    #[error("signing key unavailable: {0}")]
    KeyUnavailable(KeyLookupError),

    #[error("signature does not match")]
    BadSignature,

    #[error("invalid claim: {0}")]
    ClaimInvalid(Claim),
}

/// Uniform rejection surfaced to callers of a protected route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unauthorized")]
pub struct Unauthenticated;

/// Client-side authentication errors.
///
/// Cloneable so that a failed login can be parked in
/// [`SessionState::LoginFailed`](crate::session::SessionState::LoginFailed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("not authenticated — run `warden login`")]
    NotAuthenticated,

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("session manager has been disposed")]
    Disposed,

    #[error("flow was superseded by a newer session transition")]
    Superseded,

    #[error("login cancelled by user")]
    UserCancelled,

    #[error("browser could not be opened: {0}")]
    PopupBlocked(String),

    #[error("callback state mismatch — possible CSRF")]
    StateMismatch,

    #[error("{operation} timed out after {secs}s")]
    TimedOut { operation: &'static str, secs: u64 },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("identity provider rejected the request: {error}")]
    ProviderRejected {
        error: String,
        description: Option<String>,
    },

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("ID token rejected: {0}")]
    InvalidIdToken(Rejection),

    #[error("an audience is required to request an access token")]
    MissingAudience,

    #[error("token store error: {0}")]
    TokenStoreError(String),
}

impl AuthError {
    /// Whether the provider said the stored credential is no longer usable.
    #[must_use]
    pub fn is_invalid_grant(&self) -> bool {
        matches!(
            self,
            Self::ProviderRejected { error, .. }
                if error == "invalid_grant" || error == "login_required"
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        Self::NetworkError(error.to_string())
    }
}
