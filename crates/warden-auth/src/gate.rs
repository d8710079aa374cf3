//! Request-boundary guard for protected routes.

use std::sync::Arc;

use crate::claims::TokenClaims;
use crate::error::Unauthenticated;
use crate::jwks::KeySetSource;
use crate::verifier::{TokenVerifier, VerificationResult};

/// Verified identity attached to a request's processing context.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub claims: Arc<TokenClaims>,
}

impl AuthContext {
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }
}

/// Extracts and verifies the bearer token on each protected request.
///
/// Stateless per request; the only shared state is the verifier's key cache.
pub struct AuthGate<S> {
    verifier: Arc<TokenVerifier<S>>,
    issuer: String,
    audience: String,
}

impl<S: KeySetSource> AuthGate<S> {
    #[must_use]
    pub fn new(
        verifier: Arc<TokenVerifier<S>>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Authenticate a request from its `Authorization` header value.
    ///
    /// # Errors
    ///
    /// Returns [`Unauthenticated`] for a missing or non-bearer header and for
    /// every verifier rejection. The specific reason is only logged.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<AuthContext, Unauthenticated> {
        let Some(token) = authorization.and_then(bearer_token) else {
            tracing::debug!("request without bearer token");
            return Err(Unauthenticated);
        };

        match self
            .verifier
            .verify(token, &self.issuer, &self.audience)
            .await
        {
            VerificationResult::Valid(claims) => Ok(AuthContext { claims }),
            VerificationResult::Rejected(reason) => {
                tracing::warn!(%reason, "rejected bearer token");
                Err(Unauthenticated)
            }
        }
    }
}

/// Token from an `Authorization: Bearer <token>` value. Scheme is case-insensitive.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
