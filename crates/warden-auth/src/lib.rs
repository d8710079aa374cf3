//! # warden-auth
//!
//! Bearer-token authentication against an OIDC identity provider.
//!
//! Server side: [`KeySetCache`] (single-flight, rate-limited JWKS cache),
//! [`TokenVerifier`] (RS256 + claim checks) and [`AuthGate`] (per-request
//! guard that collapses every rejection into [`Unauthenticated`]).
//!
//! Client side: [`AuthSessionManager`] drives interactive login, silent
//! re-authentication and refresh through an [`IdentityProvider`], with
//! [`AccessTokenCache`] for audience-scoped tokens and a [`CredentialStore`]
//! that keeps the refresh credential between runs.

pub mod browser_flow;
pub mod claims;
pub mod error;
pub mod gate;
pub mod jwks;
pub mod key_cache;
pub mod oidc;
pub mod provider;
pub mod session;
pub mod token_cache;
pub mod token_store;
pub mod verifier;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use claims::{Audience, Claim, TokenClaims, UserClaims};
pub use error::{AuthError, KeyLookupError, Rejection, Unauthenticated};
pub use gate::{AuthContext, AuthGate, bearer_token};
pub use jwks::{HttpKeySetSource, JwkSet, KeySetSource, SigningKey, StaticKeySource};
pub use key_cache::{KeyCacheOptions, KeySetCache};
pub use oidc::{OidcClient, OidcClientOptions, ProviderEndpoints};
pub use provider::{IdentityProvider, TokenResponse};
pub use session::{AuthSessionManager, SessionOptions, SessionState};
pub use token_cache::{AccessToken, AccessTokenCache, IssuedToken};
pub use token_store::{CredentialSource, CredentialStore, KeyringStore, MemoryStore};
pub use verifier::{TokenVerifier, VerificationResult, VerifierOptions};
