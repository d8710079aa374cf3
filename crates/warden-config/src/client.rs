//! CLI login session settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_scope() -> String {
    "openid profile email offline_access".to_string()
}

const fn default_token_margin_secs() -> u64 {
    30
}

const fn default_refresh_lead_secs() -> u64 {
    60
}

const fn default_silent_timeout_secs() -> u64 {
    10
}

const fn default_login_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Public OIDC client identifier registered with the provider.
    #[serde(default)]
    pub client_id: String,

    /// Default API audience requested at login and by `warden token`.
    #[serde(default)]
    pub audience: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Fixed loopback port for the login callback. Ephemeral when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,

    /// Where the provider sends the browser after logout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,

    /// Extra query parameters appended to the authorize request.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,

    #[serde(default = "default_token_margin_secs")]
    pub token_margin_secs: u64,

    #[serde(default = "default_refresh_lead_secs")]
    pub refresh_lead_secs: u64,

    #[serde(default = "default_silent_timeout_secs")]
    pub silent_timeout_secs: u64,

    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            audience: String::new(),
            scope: default_scope(),
            redirect_port: None,
            login_hint: None,
            return_to: None,
            extra_params: BTreeMap::new(),
            token_margin_secs: default_token_margin_secs(),
            refresh_lead_secs: default_refresh_lead_secs(),
            silent_timeout_secs: default_silent_timeout_secs(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
    }

    pub const fn token_margin(&self) -> Duration {
        Duration::from_secs(self.token_margin_secs)
    }

    pub const fn refresh_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }

    pub const fn silent_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_timeout_secs)
    }

    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    /// Extra authorize parameters in a stable order.
    pub fn extra_params(&self) -> Vec<(String, String)> {
        self.extra_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_configured() {
            return Ok(());
        }
        if !self.scope.split_whitespace().any(|s| s == "openid") {
            return Err(ConfigError::invalid(
                "client.scope",
                "must include `openid` to receive an ID token",
            ));
        }
        if self.redirect_port == Some(0) {
            return Err(ConfigError::invalid(
                "client.redirect_port",
                "leave unset for an ephemeral port",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let config = ClientConfig::default();
        assert!(!config.is_configured());
        assert_eq!(config.scope, "openid profile email offline_access");
        assert_eq!(config.token_margin(), Duration::from_secs(30));
        assert_eq!(config.refresh_lead(), Duration::from_secs(60));
        assert_eq!(config.silent_timeout(), Duration::from_secs(10));
        assert_eq!(config.login_timeout(), Duration::from_secs(120));
        assert!(config.redirect_port.is_none());
    }

    #[test]
    fn unconfigured_client_skips_validation() {
        let config = ClientConfig {
            scope: "profile".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn scope_without_openid_is_invalid() {
        let config = ClientConfig {
            client_id: "cli".into(),
            scope: "profile email".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "client.scope"
        ));
    }

    #[test]
    fn extra_params_are_sorted() {
        let mut config = ClientConfig::default();
        config.extra_params.insert("prompt".into(), "login".into());
        config.extra_params.insert("connection".into(), "github".into());
        assert_eq!(
            config.extra_params(),
            vec![
                ("connection".to_string(), "github".to_string()),
                ("prompt".to_string(), "login".to_string()),
            ]
        );
    }
}
