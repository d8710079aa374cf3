//! Turns [`WardenConfig`] into the auth components each command needs.

use std::sync::Arc;

use anyhow::Context;
use warden_auth::oidc::issuer_for_domain;
use warden_auth::{
    AuthSessionManager, CredentialStore, HttpKeySetSource, KeyCacheOptions, KeySetCache,
    KeySetSource, KeyringStore, OidcClient, OidcClientOptions, ProviderEndpoints, SessionOptions,
    TokenVerifier, VerifierOptions,
};
use warden_config::{ClientConfig, JwksConfig, ProviderConfig, VerifierConfig, WardenConfig};

pub type Provider = OidcClient<HttpKeySetSource>;
pub type Session = AuthSessionManager<Provider>;

pub fn load_config() -> anyhow::Result<WardenConfig> {
    WardenConfig::load_with_dotenv().context("failed to load warden configuration")
}

pub fn key_cache_options(jwks: &JwksConfig) -> KeyCacheOptions {
    KeyCacheOptions {
        ttl: jwks.cache_ttl(),
        max_fetches_per_minute: jwks.max_fetches_per_minute,
        fetch_timeout: jwks.fetch_timeout(),
        serve_stale: jwks.serve_stale,
    }
}

pub const fn verifier_options(verifier: &VerifierConfig) -> VerifierOptions {
    VerifierOptions {
        leeway: verifier.leeway(),
    }
}

/// Endpoints from `provider.domain`, with each explicit URL taking precedence.
pub fn endpoints(provider: &ProviderConfig) -> ProviderEndpoints {
    let mut endpoints = if provider.domain.is_empty() {
        ProviderEndpoints {
            authorize: String::new(),
            token: String::new(),
            logout: String::new(),
            jwks: String::new(),
        }
    } else {
        ProviderEndpoints::from_domain(&provider.domain)
    };

    for (slot, value) in [
        (&mut endpoints.authorize, &provider.authorize_url),
        (&mut endpoints.token, &provider.token_url),
        (&mut endpoints.logout, &provider.logout_url),
        (&mut endpoints.jwks, &provider.jwks_url),
    ] {
        if !value.is_empty() {
            slot.clone_from(value);
        }
    }
    endpoints
}

pub fn issuer(provider: &ProviderConfig) -> String {
    if provider.issuer.is_empty() {
        issuer_for_domain(&provider.domain)
    } else {
        provider.issuer.clone()
    }
}

pub fn session_options(client: &ClientConfig) -> SessionOptions {
    SessionOptions {
        audience: client.audience.clone(),
        scope: client.scope.clone(),
        login_hint: client.login_hint.clone(),
        extra_params: client.extra_params(),
        token_margin: client.token_margin(),
        refresh_lead: client.refresh_lead(),
        silent_timeout: client.silent_timeout(),
        refresh_timeout: client.silent_timeout(),
    }
}

/// Verifier backed by `source` with the configured cache and leeway.
pub fn verifier<S: KeySetSource>(source: S, config: &WardenConfig) -> TokenVerifier<S> {
    let cache = KeySetCache::with_options(source, key_cache_options(&config.jwks));
    TokenVerifier::with_options(Arc::new(cache), verifier_options(&config.verifier))
}

/// Verifier reading keys from the provider's published JWKS.
pub fn http_verifier(config: &WardenConfig) -> anyhow::Result<TokenVerifier<HttpKeySetSource>> {
    let provider = config.require_provider()?;
    let endpoints = endpoints(provider);
    let source = HttpKeySetSource::new(endpoints.jwks, config.jwks.fetch_timeout())
        .context("failed to build JWKS client")?;
    Ok(verifier(source, config))
}

/// Session manager over the configured provider and the OS keychain.
pub fn session(config: &WardenConfig) -> anyhow::Result<Session> {
    let store = KeyringStore::new().context("failed to open credential store")?;
    session_with_store(config, Arc::new(store))
}

pub fn session_with_store(
    config: &WardenConfig,
    store: Arc<dyn CredentialStore>,
) -> anyhow::Result<Session> {
    let provider_config = config.require_provider()?;
    let client = config.require_client()?;

    let endpoints = endpoints(provider_config);
    if endpoints.authorize.is_empty() || endpoints.token.is_empty() {
        anyhow::bail!(
            "provider endpoints are incomplete — set WARDEN_PROVIDER__DOMAIN or both authorize_url and token_url"
        );
    }

    let options = OidcClientOptions {
        redirect_port: client.redirect_port,
        return_to: client.return_to.clone(),
        login_timeout: client.login_timeout(),
        ..OidcClientOptions::new(client.client_id.clone())
    };
    let id_tokens = http_verifier(config)?;
    let provider = OidcClient::new(endpoints, issuer(provider_config), options, id_tokens)
        .context("failed to build OIDC client")?;

    Ok(AuthSessionManager::new(
        Arc::new(provider),
        store,
        session_options(client),
    ))
}
