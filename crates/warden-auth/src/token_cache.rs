//! Client-side cache of access tokens, keyed by audience and scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AuthError;
use crate::provider::{IdentityProvider, TokenResponse};

/// Default safety margin before true expiry.
pub const DEFAULT_TOKEN_MARGIN: Duration = Duration::from_secs(30);

/// An access token for one audience/scope pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub audience: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Build from a token-endpoint response received at `issued_at`.
    #[must_use]
    pub fn from_response(
        response: &TokenResponse,
        audience: &str,
        scope: &str,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let lifetime = i64::try_from(response.expires_in).unwrap_or(i64::MAX);
        Self {
            value: response.access_token.clone(),
            audience: audience.to_string(),
            scope: response.scope.clone().unwrap_or_else(|| scope.to_string()),
            expires_at: issued_at + TimeDelta::seconds(lifetime.min(i64::from(i32::MAX))),
        }
    }

    /// Whether the token is expired or expires within `margin`.
    #[must_use]
    pub fn is_near_expiry(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        self.expires_at <= now + margin
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("audience", &self.audience)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A token from [`AccessTokenCache::get_token`], plus the replacement
/// refresh credential when the provider rotated it during renewal.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: AccessToken,
    pub rotated_credential: Option<String>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &self.token)
            .field("rotated", &self.rotated_credential.is_some())
            .finish()
    }
}

type CacheKey = (String, String);

#[derive(Default)]
struct Entries {
    /// Bumped by `clear`; renewals started before a clear are discarded.
    generation: u64,
    tokens: HashMap<CacheKey, AccessToken>,
}

/// Serves cached access tokens and renews them through the provider.
///
/// The entry lock is synchronous and never held across the provider call.
pub struct AccessTokenCache<P> {
    provider: Arc<P>,
    margin: Duration,
    entries: Mutex<Entries>,
}

impl<P: IdentityProvider> AccessTokenCache<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, margin: Duration) -> Self {
        Self {
            provider,
            margin,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Return a usable token for `audience`/`scope`, renewing when needed.
    ///
    /// A renewal that rotates the refresh credential reports the new one in
    /// [`IssuedToken::rotated_credential`]; the caller must replace its copy.
    ///
    /// # Errors
    ///
    /// - `MissingAudience` for an empty audience
    /// - `NotAuthenticated` if renewal is needed and there is no credential
    /// - whatever the provider returned; the cache is left as it was
    pub async fn get_token(
        &self,
        audience: &str,
        scope: &str,
        credential: Option<&str>,
    ) -> Result<IssuedToken, AuthError> {
        if audience.is_empty() {
            return Err(AuthError::MissingAudience);
        }
        let key = (audience.to_string(), scope.to_string());

        let generation = {
            let entries = self.lock();
            if let Some(token) = entries.tokens.get(&key)
                && !token.is_near_expiry(self.margin, Utc::now())
            {
                return Ok(IssuedToken {
                    token: token.clone(),
                    rotated_credential: None,
                });
            }
            entries.generation
        };

        let credential = credential.ok_or(AuthError::NotAuthenticated)?;
        tracing::debug!(audience, scope, "requesting new access token");
        let issued_at = Utc::now();
        let response = self.provider.refresh(credential, audience, scope).await?;
        let token = AccessToken::from_response(&response, audience, scope, issued_at);
        let rotated_credential = response.refresh_token.filter(|rt| rt != credential);

        let mut entries = self.lock();
        if entries.generation == generation {
            entries.tokens.insert(key, token.clone());
        } else {
            tracing::debug!(audience, "cache cleared during renewal; not storing token");
        }
        Ok(IssuedToken {
            token,
            rotated_credential,
        })
    }
}

impl<P> AccessTokenCache<P> {
    /// Store a token obtained elsewhere (e.g. by the login exchange).
    pub fn seed(&self, token: AccessToken) {
        let key = (token.audience.clone(), token.scope.clone());
        self.lock().tokens.insert(key, token);
    }

    /// Drop every cached token.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.generation += 1;
        entries.tokens.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
