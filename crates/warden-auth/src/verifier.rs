//! RS256 bearer-token verification against the cached provider key set.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;

use crate::claims::{Claim, TokenClaims, TokenHeader};
use crate::error::Rejection;
use crate::jwks::{ACCEPTED_ALGORITHM, KeySetSource};
use crate::key_cache::KeySetCache;

/// Default clock-skew tolerance for `exp`/`nbf`.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct VerifierOptions {
    pub leeway: Duration,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            leeway: DEFAULT_LEEWAY,
        }
    }
}

/// Outcome of verifying one token. There is no third, partial outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Valid(Arc<TokenClaims>),
    Rejected(Rejection),
}

impl VerificationResult {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Convert into a `Result`, for callers that want `?`.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    pub fn into_result(self) -> Result<Arc<TokenClaims>, Rejection> {
        match self {
            Self::Valid(claims) => Ok(claims),
            Self::Rejected(reason) => Err(reason),
        }
    }
}

pub struct TokenVerifier<S> {
    keys: Arc<KeySetCache<S>>,
    options: VerifierOptions,
}

impl<S: KeySetSource> TokenVerifier<S> {
    #[must_use]
    pub fn new(keys: Arc<KeySetCache<S>>) -> Self {
        Self::with_options(keys, VerifierOptions::default())
    }

    #[must_use]
    pub const fn with_options(keys: Arc<KeySetCache<S>>, options: VerifierOptions) -> Self {
        Self { keys, options }
    }

    #[must_use]
    pub const fn key_cache(&self) -> &Arc<KeySetCache<S>> {
        &self.keys
    }

    /// Verify `token` against the current time.
    pub async fn verify(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> VerificationResult {
        self.verify_at(token, expected_issuer, expected_audience, Utc::now())
            .await
    }

    /// Verify `token` as of `now`.
    pub async fn verify_at(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now: DateTime<Utc>,
    ) -> VerificationResult {
        match self
            .check(token, expected_issuer, expected_audience, now)
            .await
        {
            Ok(claims) => {
                tracing::debug!(sub = ?claims.sub, "token verified");
                VerificationResult::Valid(Arc::new(claims))
            }
            Err(reason) => {
                tracing::debug!(%reason, "token rejected");
                VerificationResult::Rejected(reason)
            }
        }
    }

    async fn check(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, Rejection> {
        let parts = split_compact(token)?;

        let header: TokenHeader = serde_json::from_slice(&parts.header)
            .map_err(|_| Rejection::Malformed("header is not a JOSE header"))?;
        if header.alg != ACCEPTED_ALGORITHM {
            return Err(Rejection::UnsupportedAlgorithm);
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or(Rejection::Malformed("header has no kid"))?;

        let key = self
            .keys
            .get_key(kid)
            .await
            .map_err(Rejection::KeyUnavailable)?;

        let signed = &token[..parts.signing_input_len];
        let signature_ok = jsonwebtoken::crypto::verify(
            parts.signature,
            signed.as_bytes(),
            key.decoding_key(),
            Algorithm::RS256,
        )
        .unwrap_or(false);
        if !signature_ok {
            return Err(Rejection::BadSignature);
        }

        let claims: TokenClaims = serde_json::from_slice(&parts.payload)
            .map_err(|_| Rejection::Malformed("payload is not a claim set"))?;
        self.validate_claims(&claims, expected_issuer, expected_audience, now)?;
        Ok(claims)
    }

    fn validate_claims(
        &self,
        claims: &TokenClaims,
        expected_issuer: &str,
        expected_audience: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if claims.iss.as_deref() != Some(expected_issuer) {
            return Err(Rejection::ClaimInvalid(Claim::Issuer));
        }
        if !claims.aud.contains(expected_audience) {
            return Err(Rejection::ClaimInvalid(Claim::Audience));
        }

        let leeway = i64::try_from(self.options.leeway.as_secs()).unwrap_or(i64::MAX);
        let now = now.timestamp();

        match claims.exp {
            Some(exp) if now < exp.saturating_add(leeway) => {}
            _ => return Err(Rejection::ClaimInvalid(Claim::Expiry)),
        }
        if let Some(nbf) = claims.nbf
            && now.saturating_add(leeway) < nbf
        {
            return Err(Rejection::ClaimInvalid(Claim::NotBefore));
        }
        Ok(())
    }
}

struct CompactParts<'a> {
    header: Vec<u8>,
    payload: Vec<u8>,
    signature: &'a str,
    /// Length of `header.payload`, the signed bytes.
    signing_input_len: usize,
}

fn split_compact(token: &str) -> Result<CompactParts<'_>, Rejection> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(Rejection::Malformed("token must have three segments"));
    };
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return Err(Rejection::Malformed("empty token segment"));
    }

    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| Rejection::Malformed("segment is not base64url"))
    };
    let header_bytes = decode(header)?;
    let payload_bytes = decode(payload)?;
    decode(signature)?;

    Ok(CompactParts {
        header: header_bytes,
        payload: payload_bytes,
        signature,
        signing_input_len: header.len() + 1 + payload.len(),
    })
}
