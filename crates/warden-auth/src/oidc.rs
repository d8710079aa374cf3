//! HTTP client for an OIDC provider laid out like Auth0.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::browser_flow::{self, BrowserLogin};
use crate::claims::UserClaims;
use crate::error::AuthError;
use crate::jwks::KeySetSource;
use crate::provider::{AuthorizationGrant, AuthorizeRequest, IdentityProvider, TokenResponse};
use crate::verifier::{TokenVerifier, VerificationResult};

/// Default wait for the browser callback.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider endpoints. Each can be overridden individually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize: String,
    pub token: String,
    pub logout: String,
    pub jwks: String,
}

impl ProviderEndpoints {
    /// Auth0 layout under `domain` (bare host or URL).
    #[must_use]
    pub fn from_domain(domain: &str) -> Self {
        let base = base_url(domain);
        Self {
            authorize: format!("{base}/authorize"),
            token: format!("{base}/oauth/token"),
            logout: format!("{base}/v2/logout"),
            jwks: format!("{base}/.well-known/jwks.json"),
        }
    }
}

/// Issuer identifier the provider puts in `iss` for `domain`.
#[must_use]
pub fn issuer_for_domain(domain: &str) -> String {
    format!("{}/", base_url(domain))
}

fn base_url(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[derive(Debug, Clone)]
pub struct OidcClientOptions {
    pub client_id: String,
    pub redirect_port: Option<u16>,
    /// Where the provider sends the browser after logout.
    pub return_to: Option<String>,
    pub login_timeout: Duration,
    pub http_timeout: Duration,
    pub open_browser: bool,
}

impl OidcClientOptions {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_port: None,
            return_to: None,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            open_browser: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`IdentityProvider`] over HTTP. ID tokens are checked with the same
/// verifier used for access tokens, with the client ID as audience.
pub struct OidcClient<S> {
    http: reqwest::Client,
    endpoints: ProviderEndpoints,
    issuer: String,
    options: OidcClientOptions,
    id_tokens: TokenVerifier<S>,
}

impl<S: KeySetSource> OidcClient<S> {
    /// # Errors
    ///
    /// Returns `AuthError::NetworkError` if the HTTP client cannot be built.
    pub fn new(
        endpoints: ProviderEndpoints,
        issuer: impl Into<String>,
        options: OidcClientOptions,
        id_tokens: TokenVerifier<S>,
    ) -> Result<Self, AuthError> {
        // Logout answers with a redirect to `returnTo`, which must not be followed.
        let http = reqwest::Client::builder()
            .timeout(options.http_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            endpoints,
            issuer: issuer.into(),
            options,
            id_tokens,
        })
    }

    #[must_use]
    pub const fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let grant_type = params
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map_or("", |(_, v)| *v);
        tracing::debug!(endpoint = %self.endpoints.token, grant_type, "token request");

        let response = self
            .http
            .post(&self.endpoints.token)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form_body(params))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AuthError::NetworkError(format!("malformed token response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ProviderErrorBody>(&body) {
            Ok(rejection) => {
                tracing::warn!(%status, error = %rejection.error, grant_type, "token endpoint rejected request");
                Err(AuthError::ProviderRejected {
                    error: rejection.error,
                    description: rejection.error_description,
                })
            }
            Err(_) => Err(AuthError::NetworkError(format!(
                "token endpoint returned status {status}"
            ))),
        }
    }
}

impl<S: KeySetSource + 'static> IdentityProvider for OidcClient<S> {
    async fn authorize_interactive(
        &self,
        request: &AuthorizeRequest,
        cancel: CancellationToken,
    ) -> Result<AuthorizationGrant, AuthError> {
        let login = BrowserLogin {
            authorize_endpoint: &self.endpoints.authorize,
            client_id: &self.options.client_id,
            redirect_port: self.options.redirect_port,
            timeout: self.options.login_timeout,
            open_browser: self.options.open_browser,
        };
        browser_flow::authorize(&login, request, cancel).await
    }

    async fn exchange_code(&self, grant: &AuthorizationGrant) -> Result<TokenResponse, AuthError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.options.client_id.as_str()),
            ("code", grant.code.as_str()),
            ("code_verifier", grant.code_verifier.as_str()),
            ("redirect_uri", grant.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        audience: &str,
        scope: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.options.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if !audience.is_empty() {
            params.push(("audience", audience));
        }
        if !scope.is_empty() {
            params.push(("scope", scope));
        }
        self.token_request(&params).await
    }

    async fn validate_id_token(&self, id_token: &str) -> Result<UserClaims, AuthError> {
        match self
            .id_tokens
            .verify(id_token, &self.issuer, &self.options.client_id)
            .await
        {
            VerificationResult::Valid(claims) => UserClaims::from_token_claims(&claims),
            VerificationResult::Rejected(reason) => Err(AuthError::InvalidIdToken(reason)),
        }
    }

    async fn end_session(&self, id_token_hint: Option<&str>) -> Result<(), AuthError> {
        let mut query = vec![("client_id", self.options.client_id.as_str())];
        if let Some(return_to) = &self.options.return_to {
            query.push(("returnTo", return_to.as_str()));
        }
        if let Some(hint) = id_token_hint {
            query.push(("id_token_hint", hint));
        }

        let url = format!("{}?{}", self.endpoints.logout, form_body(&query));
        let status = self.http.get(url).send().await?.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(AuthError::NetworkError(format!(
                "logout endpoint returned status {status}"
            )))
        }
    }
}

fn form_body(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::claims::Claim;
    use crate::error::Rejection;
    use crate::jwks::StaticKeySource;
    use crate::key_cache::KeySetCache;
    use crate::testutil::{self, ISSUER};

    const CLIENT_ID: &str = "spa-client";

    fn client(server: &MockServer) -> OidcClient<StaticKeySource> {
        let endpoints = ProviderEndpoints::from_domain(&server.uri());
        let keys = KeySetCache::new(StaticKeySource::new(testutil::primary_key_set()));
        let mut options = OidcClientOptions::new(CLIENT_ID);
        options.return_to = Some("http://localhost:3000".into());
        OidcClient::new(endpoints, ISSUER, options, TokenVerifier::new(Arc::new(keys)))
            .expect("client builds")
    }

    fn token_body() -> serde_json::Value {
        json!({
            "access_token": "at-1",
            "id_token": "id-1",
            "refresh_token": "rt-1",
            "expires_in": 86400,
            "scope": "openid profile email offline_access",
            "token_type": "Bearer",
        })
    }

    #[test]
    fn endpoints_follow_auth0_layout() {
        assert_eq!(
            ProviderEndpoints::from_domain("klee-test.au.auth0.com"),
            ProviderEndpoints {
                authorize: "https://klee-test.au.auth0.com/authorize".into(),
                token: "https://klee-test.au.auth0.com/oauth/token".into(),
                logout: "https://klee-test.au.auth0.com/v2/logout".into(),
                jwks: "https://klee-test.au.auth0.com/.well-known/jwks.json".into(),
            }
        );
        assert_eq!(
            issuer_for_domain("https://klee-test.au.auth0.com/"),
            "https://klee-test.au.auth0.com/"
        );
    }

    #[test]
    fn form_body_encodes_reserved_characters() {
        assert_eq!(
            form_body(&[("redirect_uri", "http://127.0.0.1:1/callback"), ("scope", "openid email")]),
            "redirect_uri=http%3A%2F%2F127.0.0.1%3A1%2Fcallback&scope=openid%20email"
        );
    }

    #[tokio::test]
    async fn code_exchange_posts_pkce_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("code_verifier=ver"))
            .and(body_string_contains(format!("client_id={CLIENT_ID}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&server)
            .await;

        let grant = AuthorizationGrant {
            code: "abc".into(),
            code_verifier: "ver".into(),
            redirect_uri: "http://127.0.0.1:9/callback".into(),
        };
        let tokens = client(&server).exchange_code(&grant).await.expect("exchange");
        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(tokens.expires_in, 86400);
    }

    #[tokio::test]
    async fn refresh_sends_audience_and_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("audience=TheSweetestAPI"))
            .and(body_string_contains("scope=read%3Asecrets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .refresh("rt-1", "TheSweetestAPI", "read:secrets")
            .await
            .expect("refresh");
    }

    #[tokio::test]
    async fn provider_error_body_becomes_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Unknown or invalid refresh token.",
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .refresh("revoked", "api", "")
            .await
            .expect_err("rejected");
        assert!(err.is_invalid_grant());
        assert_eq!(
            err,
            AuthError::ProviderRejected {
                error: "invalid_grant".into(),
                description: Some("Unknown or invalid refresh token.".into()),
            }
        );
    }

    #[tokio::test]
    async fn opaque_server_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let err = client(&server)
            .refresh("rt", "api", "")
            .await
            .expect_err("fails");
        assert!(matches!(err, AuthError::NetworkError(ref m) if m.contains("502")));
    }

    #[tokio::test]
    async fn end_session_calls_logout_with_client_and_return_to() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/logout"))
            .and(query_param("client_id", CLIENT_ID))
            .and(query_param("returnTo", "http://localhost:3000"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).end_session(None).await.expect("logout");
    }

    #[tokio::test]
    async fn id_token_for_this_client_yields_profile() {
        let server = MockServer::start().await;
        let mut claims = testutil::claims(300);
        claims["aud"] = json!(CLIENT_ID);
        claims["name"] = json!("Bruce Wayne");
        claims["picture"] = json!("https://gravatar.example/bruce.png");
        let id_token = testutil::sign_primary(&claims);

        let user = client(&server)
            .validate_id_token(&id_token)
            .await
            .expect("valid id token");
        assert_eq!(user.sub, testutil::SUBJECT);
        assert_eq!(user.name.as_deref(), Some("Bruce Wayne"));
        assert_eq!(user.picture.as_deref(), Some("https://gravatar.example/bruce.png"));
    }

    #[tokio::test]
    async fn id_token_for_another_client_is_rejected() {
        let server = MockServer::start().await;
        let id_token = testutil::sign_primary(&testutil::claims(300));

        let err = client(&server)
            .validate_id_token(&id_token)
            .await
            .expect_err("audience is the API, not this client");
        assert_eq!(err, AuthError::InvalidIdToken(Rejection::ClaimInvalid(Claim::Audience)));
    }
}
