//! # warden-config
//!
//! Layered configuration loading for Warden using figment.
//!
//! Configuration sources (in priority order, highest wins):
//! 1. Environment variables (`WARDEN_*` prefix, `__` as separator)
//! 2. Project-level `.warden/config.toml`
//! 3. User-level `~/.config/warden/config.toml`
//! 4. Built-in defaults
//!
//! Figment maps `WARDEN_PROVIDER__DOMAIN` -> `provider.domain`,
//! `WARDEN_CLIENT__CLIENT_ID` -> `client.client_id`, etc.
//!
//! ```no_run
//! use warden_config::WardenConfig;
//!
//! let config = WardenConfig::load_with_dotenv().expect("config");
//! if config.provider.is_configured() {
//!     println!("Provider: {}", config.provider.domain);
//! }
//! ```

mod client;
mod error;
mod jwks;
mod provider;
mod server;
mod verifier;

pub use client::ClientConfig;
pub use error::ConfigError;
pub use jwks::JwksConfig;
pub use provider::ProviderConfig;
pub use server::ServerConfig;
pub use verifier::VerifierConfig;

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub jwks: JwksConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl WardenConfig {
    /// Load and validate configuration from TOML files and the environment.
    ///
    /// Does not read `.env`; see [`Self::load_with_dotenv`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment())
    }

    /// Load configuration after applying the workspace `.env` file.
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        Self::load_dotenv_from_workspace();
        Self::load()
    }

    /// Extract and validate from an arbitrary provider chain.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the figment provider chain.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            figment = figment.merge(Toml::file(global_path));
        }

        let local_path = PathBuf::from(".warden/config.toml");
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed("WARDEN_").split("__"))
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jwks.validate()?;
        self.client.validate()?;
        self.server.socket_addr()?;
        Ok(())
    }

    /// Provider section, or `NotConfigured` when neither a domain nor an
    /// issuer/JWKS pair is set.
    pub fn require_provider(&self) -> Result<&ProviderConfig, ConfigError> {
        if self.provider.is_configured() {
            Ok(&self.provider)
        } else {
            Err(ConfigError::NotConfigured {
                section: "provider".into(),
            })
        }
    }

    pub fn require_client(&self) -> Result<&ClientConfig, ConfigError> {
        if self.client.is_configured() {
            Ok(&self.client)
        } else {
            Err(ConfigError::NotConfigured {
                section: "client".into(),
            })
        }
    }

    pub fn require_verifier(&self) -> Result<&VerifierConfig, ConfigError> {
        if self.verifier.is_configured() {
            Ok(&self.verifier)
        } else {
            Err(ConfigError::NotConfigured {
                section: "verifier".into(),
            })
        }
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("warden").join("config.toml"))
    }

    /// Walks up from `CARGO_MANIFEST_DIR` (at most three levels) looking for
    /// `.env`, then falls back to the current directory.
    fn load_dotenv_from_workspace() {
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let mut dir = PathBuf::from(manifest_dir);
            for _ in 0..3 {
                let env_path = dir.join(".env");
                if env_path.exists() {
                    let _ = dotenvy::from_path(&env_path);
                    return;
                }
                if !dir.pop() {
                    break;
                }
            }
        }

        let _ = dotenvy::dotenv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_unconfigured_but_valid() {
        let config = WardenConfig::default();
        assert!(!config.provider.is_configured());
        assert!(!config.client.is_configured());
        assert!(!config.verifier.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_survive_the_serialized_provider() {
        let figment = Figment::from(Serialized::defaults(WardenConfig::default()));
        let config = WardenConfig::from_figment(&figment).expect("should extract defaults");
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn require_reports_the_missing_section() {
        let err = WardenConfig::default().require_client().unwrap_err();
        assert!(matches!(err, ConfigError::NotConfigured { ref section } if section == "client"));
    }

    #[test]
    fn invalid_bind_fails_validation() {
        let mut config = WardenConfig::default();
        config.server.bind = "not an address".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "server.bind"
        ));
    }
}
