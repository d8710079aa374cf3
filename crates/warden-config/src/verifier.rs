//! Server-side token verification settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_leeway_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VerifierConfig {
    /// API identifier expected in `aud`, e.g. `TheSweetestAPI`.
    #[serde(default)]
    pub audience: String,

    /// Clock-skew tolerance for `exp` and `nbf`.
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            audience: String::new(),
            leeway_secs: default_leeway_secs(),
        }
    }
}

impl VerifierConfig {
    pub fn is_configured(&self) -> bool {
        !self.audience.is_empty()
    }

    pub const fn leeway(&self) -> Duration {
        Duration::from_secs(self.leeway_secs)
    }
}
