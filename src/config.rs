//! Runtime configuration.
//!
//! Defaults suit a main process. Values may come from TOML and be overridden from the
//! environment:
//!
//! ```toml
//! shutdown_grace_ms = 10000
//! dispatcher_thread_name = "IPC Background"
//! role = "main"
//! ```
//!
//! | Variable                          | Field                    |
//! |-----------------------------------|--------------------------|
//! | `BACKGROUND_IPC_SHUTDOWN_GRACE_MS`| `shutdown_grace_ms`      |
//! | `BACKGROUND_IPC_THREAD_NAME`      | `dispatcher_thread_name` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const SHUTDOWN_GRACE_ENV: &str = "BACKGROUND_IPC_SHUTDOWN_GRACE_MS";
pub const THREAD_NAME_ENV: &str = "BACKGROUND_IPC_THREAD_NAME";

/// Which side of the process split this process is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// Hosts the dispatcher thread; child requests are served in-process.
    #[default]
    Main,
    /// Obtains child actors by asking the main process for a bridge.
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundConfig {
    /// How long shutdown waits for live actors before force-closing them.
    pub shutdown_grace_ms: u64,
    pub dispatcher_thread_name: String,
    pub role: ProcessRole,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 10_000,
            dispatcher_thread_name: "IPC Background".to_owned(),
            role: ProcessRole::Main,
        }
    }
}

impl BackgroundConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BACKGROUND_IPC_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(SHUTDOWN_GRACE_ENV) {
            self.shutdown_grace_ms = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: SHUTDOWN_GRACE_ENV,
                value: raw.clone(),
            })?;
        }
        if let Some(name) = lookup(THREAD_NAME_ENV) {
            self.dispatcher_thread_name = name;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher_thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "dispatcher_thread_name must not be empty".into(),
            ));
        }
        if self.dispatcher_thread_name.contains('\0') {
            return Err(ConfigError::Invalid(
                "dispatcher_thread_name must not contain NUL".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.dispatcher_thread_name = name.into();
        self
    }

    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BackgroundConfig::default();
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.dispatcher_thread_name, "IPC Background");
        assert_eq!(config.role, ProcessRole::Main);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = BackgroundConfig::from_toml_str("role = \"content\"\n").unwrap();
        assert_eq!(config.role, ProcessRole::Content);
        assert_eq!(config.shutdown_grace_ms, 10_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BackgroundConfig::from_toml_str("grace = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_thread_name_is_invalid() {
        let err = BackgroundConfig::from_toml_str("dispatcher_thread_name = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let config = BackgroundConfig::default()
            .with_overrides_from(|var| match var {
                SHUTDOWN_GRACE_ENV => Some("250".into()),
                THREAD_NAME_ENV => Some("bg".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.dispatcher_thread_name, "bg");
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let err = BackgroundConfig::default()
            .with_overrides_from(|var| (var == SHUTDOWN_GRACE_ENV).then(|| "soon".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: SHUTDOWN_GRACE_ENV, .. }));
    }
}
