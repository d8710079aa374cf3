//! Identity provider location.

use serde::{Deserialize, Serialize};

/// Where the OIDC provider lives.
///
/// Endpoints default from `domain` (Auth0 layout); each field below
/// overrides one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Tenant domain, e.g. `klee-test.au.auth0.com`.
    #[serde(default)]
    pub domain: String,

    /// Expected `iss` claim. Defaults to `https://{domain}/`.
    #[serde(default)]
    pub issuer: String,

    #[serde(default)]
    pub jwks_url: String,

    #[serde(default)]
    pub authorize_url: String,

    #[serde(default)]
    pub token_url: String,

    #[serde(default)]
    pub logout_url: String,
}

impl ProviderConfig {
    /// Either a domain, or an explicit issuer plus JWKS URL.
    pub fn is_configured(&self) -> bool {
        !self.domain.is_empty() || (!self.issuer.is_empty() && !self.jwks_url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_not_configured() {
        assert!(!ProviderConfig::default().is_configured());
    }

    #[test]
    fn domain_alone_is_enough() {
        let config = ProviderConfig {
            domain: "klee-test.au.auth0.com".into(),
            ..Default::default()
        };
        assert!(config.is_configured());
    }

    #[test]
    fn issuer_needs_jwks_url_without_domain() {
        let mut config = ProviderConfig {
            issuer: "https://idp.example/".into(),
            ..Default::default()
        };
        assert!(!config.is_configured());

        config.jwks_url = "https://idp.example/keys".into();
        assert!(config.is_configured());
    }
}
