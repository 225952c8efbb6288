//! Client configuration.
//!
//! Values come from a TOML document or from `SESSION_TASK_*` environment
//! variables. Missing keys fall back to the defaults below.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::TaskError;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Whole-request timeout enforced by the transport.
    pub timeout_ms: u64,
    pub user_agent: String,
    /// How many credential refreshes one task may perform.
    pub max_credential_refreshes: u32,
    /// Report non-2xx responses as `TaskError::Protocol` instead of success.
    pub status_as_error: bool,
    /// Headers added to every request unless the request already sets them.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: format!("session-task/{}", env!("CARGO_PKG_VERSION")),
            max_credential_refreshes: 1,
            status_as_error: true,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TaskError> {
        toml::from_str(raw).map_err(|e| TaskError::InvalidConfig(e.to_string()))
    }

    /// Read overrides from the environment. Unparseable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_parse::<u64>("SESSION_TASK_TIMEOUT_MS") {
            config.timeout_ms = ms;
        }
        if let Ok(agent) = std::env::var("SESSION_TASK_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(n) = env_parse::<u32>("SESSION_TASK_MAX_REFRESHES") {
            config.max_credential_refreshes = n;
        }
        if let Some(flag) = env_parse::<bool>("SESSION_TASK_STATUS_AS_ERROR") {
            config.status_as_error = flag;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    parse_value(key, &std::env::var(key).ok()?)
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn defaults_allow_one_refresh() {
        let config = ClientConfig::default();
        assert_eq!(config.max_credential_refreshes, 1);
        assert!(config.status_as_error);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.user_agent.starts_with("session-task/"));
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = ClientConfig::from_toml_str(
            r#"
            timeout_ms = 500
            status_as_error = false

            [default_headers]
            SdkVersion = "session-task-1.0"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert!(!config.status_as_error);
        assert_eq!(config.max_credential_refreshes, 1);
        assert_eq!(
            config.default_headers.get("SdkVersion").map(String::as_str),
            Some("session-task-1.0")
        );
    }

    #[test]
    fn env_values_parse_or_fall_back() {
        assert_eq!(parse_value::<u64>("SESSION_TASK_TIMEOUT_MS", " 250 "), Some(250));
        assert_eq!(parse_value::<bool>("SESSION_TASK_STATUS_AS_ERROR", "false"), Some(false));
        assert_eq!(parse_value::<u64>("SESSION_TASK_TIMEOUT_MS", "soon"), None);
        assert_eq!(parse_value::<u32>("SESSION_TASK_MAX_REFRESHES", "-1"), None);
    }

    #[test]
    #[traced_test]
    fn unparseable_env_value_is_logged_with_its_key() {
        assert_eq!(parse_value::<u32>("SESSION_TASK_MAX_REFRESHES", "many"), None);
        assert!(logs_contain("SESSION_TASK_MAX_REFRESHES"));
        assert!(logs_contain("ignoring unparseable configuration value"));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = ClientConfig::from_toml_str("timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, TaskError::InvalidConfig(_)));
    }
}
