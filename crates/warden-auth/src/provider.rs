//! The identity-provider seam used by the client-side session.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::claims::UserClaims;
use crate::error::AuthError;

/// Parameters for an interactive or silent authorization request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub audience: String,
    pub scope: String,
    pub login_hint: Option<String>,
    /// Provider-specific parameters passed through untouched.
    pub extra_params: Vec<(String, String)>,
}

/// What the provider hands back when the user completes the authorize step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until `access_token` expires.
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// An OIDC identity provider, as seen by [`AuthSessionManager`](crate::session::AuthSessionManager).
pub trait IdentityProvider: Send + Sync + 'static {
    /// Run the interactive authorize step, suspending until the user finishes,
    /// the flow fails, or `cancel` fires.
    fn authorize_interactive(
        &self,
        request: &AuthorizeRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<AuthorizationGrant, AuthError>> + Send;

    /// Exchange an authorization code for tokens.
    fn exchange_code(
        &self,
        grant: &AuthorizationGrant,
    ) -> impl Future<Output = Result<TokenResponse, AuthError>> + Send;

    /// Obtain fresh tokens from a refresh credential, for `audience`/`scope`.
    fn refresh(
        &self,
        refresh_token: &str,
        audience: &str,
        scope: &str,
    ) -> impl Future<Output = Result<TokenResponse, AuthError>> + Send;

    /// Verify an ID token and extract the user's profile.
    fn validate_id_token(
        &self,
        id_token: &str,
    ) -> impl Future<Output = Result<UserClaims, AuthError>> + Send;

    /// Ask the provider to end its own session.
    fn end_session(
        &self,
        id_token_hint: Option<&str>,
    ) -> impl Future<Output = Result<(), AuthError>> + Send;
}
