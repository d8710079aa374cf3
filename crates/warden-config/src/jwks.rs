//! Signing-key cache settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const fn default_cache_ttl_secs() -> u64 {
    600
}

const fn default_max_fetches_per_minute() -> u32 {
    5
}

const fn default_fetch_timeout_secs() -> u64 {
    5
}

const fn default_serve_stale() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JwksConfig {
    /// How long a fetched key set is trusted. `0` keeps it until a miss.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Refetch cap within any rolling minute.
    #[serde(default = "default_max_fetches_per_minute")]
    pub max_fetches_per_minute: u32,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Serve the last known key while another request refreshes the set.
    #[serde(default = "default_serve_stale")]
    pub serve_stale: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            max_fetches_per_minute: default_max_fetches_per_minute(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            serve_stale: default_serve_stale(),
        }
    }
}

impl JwksConfig {
    /// `None` when the TTL is disabled.
    pub const fn cache_ttl(&self) -> Option<Duration> {
        match self.cache_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fetches_per_minute == 0 {
            return Err(ConfigError::invalid(
                "jwks.max_fetches_per_minute",
                "must allow at least one fetch",
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "jwks.fetch_timeout_secs",
                "must be at least one second",
            ));
        }
        Ok(())
    }
}
