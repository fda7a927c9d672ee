//! Runtime Options
//!
//! Process-wide toggles the Android wrapper used to push through
//! environment variables (`ENABLE_IPV6`, `PREFER_IPV6`, `LOG_NO_COLOR`,
//! `USER_AGENT`). Here they form an immutable value handed to the runtime
//! at start, so two runtimes in one process never see each other's
//! settings.
//!
//! # File format
//!
//! ```toml
//! enable_ipv6 = true
//! prefer_ipv6 = false
//! log_no_color = true
//! user_agent = "Leaf Client For Android"
//! stop_grace_secs = 5
//! reload_policy = "drain"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// What happens to established connections on reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicy {
    /// Existing connections finish under the old configuration
    #[default]
    Drain,
    /// Existing connections are cancelled immediately
    Cut,
}

/// Immutable runtime options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Allow IPv6 destinations and resolver answers
    #[serde(default = "default_true")]
    pub enable_ipv6: bool,
    /// Try IPv6 addresses before IPv4 when both resolve
    #[serde(default)]
    pub prefer_ipv6: bool,
    /// Disable ANSI colors in log output
    #[serde(default)]
    pub log_no_color: bool,
    /// User-Agent for outgoing HTTP (DoH)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Grace period for in-flight connections on stop
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub reload_policy: ReloadPolicy,
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    "Leaf Client For Android".to_string()
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            enable_ipv6: true,
            prefer_ipv6: false,
            log_no_color: false,
            user_agent: default_user_agent(),
            stop_grace_secs: default_stop_grace_secs(),
            reload_policy: ReloadPolicy::default(),
        }
    }
}

impl RuntimeOptions {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, OptionsError> {
        toml::from_str(content).map_err(|e| OptionsError::Parse(e.to_string()))
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, OptionsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| OptionsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Apply `[Env]` overrides from a configuration
    ///
    /// Unknown keys are ignored; values that fail to parse keep the
    /// current setting.
    pub fn with_env<'a>(mut self, env: impl IntoIterator<Item = &'a (String, String)>) -> Self {
        for (key, value) in env {
            match key.as_str() {
                "ENABLE_IPV6" => set_bool(&mut self.enable_ipv6, key, value),
                "PREFER_IPV6" => set_bool(&mut self.prefer_ipv6, key, value),
                "LOG_NO_COLOR" => set_bool(&mut self.log_no_color, key, value),
                "USER_AGENT" => self.user_agent = value.clone(),
                _ => {}
            }
        }
        self
    }
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match value.to_lowercase().as_str() {
        "true" | "1" => *slot = true,
        "false" | "0" => *slot = false,
        _ => warn!("Ignoring {}={}: not a boolean", key, value),
    }
}

/// Option loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum OptionsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
