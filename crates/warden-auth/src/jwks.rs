//! JWKS (JSON Web Key Set) documents, signing keys, and key-set sources.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use x509_parser::public_key::PublicKey;

use crate::error::KeyLookupError;

/// The only signing algorithm accepted anywhere in Warden.
pub const ACCEPTED_ALGORITHM: &str = "RS256";

/// JWKS response from the provider's key endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC, oct)
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// X.509 chain, leaf first (standard base64 DER)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

/// A verified-usable RS256 public key from the provider's key set.
#[derive(Clone)]
pub struct SigningKey {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub fetched_at: DateTime<Utc>,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// Public key material for signature checks.
    #[must_use]
    pub const fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Convert a JWK into a signing key.
    ///
    /// Returns `Ok(None)` for keys that are not RS256 signing keys (they are
    /// skipped rather than cached), and `Err` for RS256 keys whose material
    /// cannot be decoded.
    ///
    /// # Errors
    ///
    /// Returns a description of the decoding failure.
    pub fn from_jwk(jwk: &Jwk, fetched_at: DateTime<Utc>) -> Result<Option<Self>, String> {
        if jwk.kty != "RSA" || jwk.key_use.as_deref() == Some("enc") {
            return Ok(None);
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != ACCEPTED_ALGORITHM) {
            return Ok(None);
        }
        let Some(kid) = jwk.kid.clone() else {
            return Ok(None);
        };

        let decoding_key = match (&jwk.n, &jwk.e, jwk.x5c.as_deref()) {
            (Some(n), Some(e), _) => DecodingKey::from_rsa_components(n, e)
                .map_err(|e| format!("RSA components: {e}"))?,
            (_, _, Some([leaf, ..])) => decoding_key_from_certificate(leaf)?,
            _ => return Err("RSA key has neither n/e nor x5c".into()),
        };

        Ok(Some(Self {
            key_id: kid,
            algorithm: Algorithm::RS256,
            fetched_at,
            decoding_key,
        }))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

fn decoding_key_from_certificate(leaf_b64: &str) -> Result<DecodingKey, String> {
    let der = STANDARD
        .decode(leaf_b64)
        .map_err(|e| format!("x5c base64: {e}"))?;
    let (_, cert) =
        x509_parser::parse_x509_certificate(&der).map_err(|e| format!("x5c certificate: {e}"))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(DecodingKey::from_rsa_raw_components(
            strip_leading_zeros(rsa.modulus),
            strip_leading_zeros(rsa.exponent),
        )),
        Ok(_) => Err("x5c certificate does not carry an RSA key".into()),
        Err(e) => Err(format!("x5c public key: {e}")),
    }
}

/// DER integers carry a sign byte; RSA components are unsigned big-endian.
fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Convert a fetched key set into the cacheable map.
///
/// Unusable records are skipped and logged.
#[must_use]
pub fn signing_keys(set: &JwkSet, fetched_at: DateTime<Utc>) -> HashMap<String, SigningKey> {
    let mut keys = HashMap::with_capacity(set.keys.len());
    for jwk in &set.keys {
        match SigningKey::from_jwk(jwk, fetched_at) {
            Ok(Some(key)) => {
                tracing::debug!(kid = %key.key_id, "loaded JWK");
                keys.insert(key.key_id.clone(), key);
            }
            Ok(None) => {
                tracing::debug!(kid = ?jwk.kid, kty = %jwk.kty, alg = ?jwk.alg, "skipping non-RS256 JWK");
            }
            Err(error) => {
                tracing::warn!(kid = ?jwk.kid, %error, "failed to parse JWK, skipping");
            }
        }
    }
    keys
}

/// Where the key-set cache gets its keys from.
pub trait KeySetSource: Send + Sync {
    /// Fetch the provider's complete published key set.
    fn fetch(&self) -> impl Future<Output = Result<JwkSet, KeyLookupError>> + Send;
}

impl<S: KeySetSource> KeySetSource for Arc<S> {
    fn fetch(&self) -> impl Future<Output = Result<JwkSet, KeyLookupError>> + Send {
        (**self).fetch()
    }
}

/// Fetches the key set from the provider's published JWKS URI.
#[derive(Debug, Clone)]
pub struct HttpKeySetSource {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySetSource {
    /// Build a source for `url`. The client-level timeout is a backstop; the
    /// cache applies its own fetch timeout as well.
    ///
    /// # Errors
    ///
    /// Returns `KeyLookupError::FetchFailed` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, KeyLookupError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyLookupError::FetchFailed(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, KeyLookupError> {
        tracing::debug!(url = %self.url, "fetching JWKS");

        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeyLookupError::FetchFailed(format!("request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyLookupError::FetchFailed(format!(
                "JWKS endpoint returned status {status}"
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| KeyLookupError::FetchFailed(format!("malformed JWKS: {e}")))
    }
}

/// A fixed key set, for offline verification and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKeySource {
    set: JwkSet,
}

impl StaticKeySource {
    #[must_use]
    pub const fn new(set: JwkSet) -> Self {
        Self { set }
    }
}

impl KeySetSource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyLookupError> {
        Ok(self.set.clone())
    }
}
