//! Layered configuration (spec.md §6 / SPEC_FULL.md §6 "(NEW) Configuration").
//!
//! Grounded on `original_source/src/gary/util/config.py`'s `Config`/
//! `GaryConfig`/`SchedulerConfig` nesting: a YAML file provides the base,
//! `serde(default)` supplies the same defaults the original hardcodes
//! (`idle_timeout_try=5.0`, `idle_timeout_force=30.0`, `allow_yapping=false`,
//! `enforce_schema=true`, `existing_connection_policy=drop_existing`). The
//! original's preset/base-preset inheritance and `$ENV:`-prefixed value
//! substitution are not carried - one flat file is enough for this gateway's
//! single-backend scope.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use gateway_core::ConflictPolicy;

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_idle_timeout_try() -> f64 {
    5.0
}

fn default_idle_timeout_force() -> f64 {
    30.0
}

fn default_existing_connection_policy() -> ConflictPolicy {
    ConflictPolicy::DropExisting
}

fn default_enforce_schema() -> bool {
    true
}

fn default_token_limit() -> usize {
    8192
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    256
}

/// Top-level config, loaded from YAML plus environment overrides
/// (`GATEWAY_BIND_ADDR` etc., applied after the file so deployments can
/// override one field without forking the whole document).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(with = "socket_addr_str")]
    pub bind_addr: SocketAddr,
    pub gary: GaryConfig,
    /// Directory of `<game>.txt` files injected as persistent custom rules
    /// on game creation (SPEC_FULL.md §9 "Custom rules file").
    pub rules_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            gary: GaryConfig::default(),
            rules_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GaryConfig {
    #[serde(default = "default_existing_connection_policy")]
    pub existing_connection_policy: ConflictPolicy,
    pub allow_yapping: bool,
    #[serde(default = "default_enforce_schema")]
    pub enforce_schema: bool,
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    pub logging: LoggingConfig,
}

impl Default for GaryConfig {
    fn default() -> Self {
        Self {
            existing_connection_policy: default_existing_connection_policy(),
            allow_yapping: false,
            enforce_schema: default_enforce_schema(),
            scheduler: SchedulerConfig::default(),
            token_limit: default_token_limit(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-module log level overrides (`config.py::LoggingConfig.modules`),
/// turned into extra `EnvFilter` directives at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub modules: std::collections::HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut modules = std::collections::HashMap::new();
        modules.insert("gateway_core::scheduler".to_string(), "warn".to_string());
        modules.insert("gateway_core::generator".to_string(), "info".to_string());
        modules.insert("gateway_server::ws".to_string(), "info".to_string());
        Self { modules }
    }
}

impl LoggingConfig {
    /// Renders `modules` as `EnvFilter` directive fragments (`target=level`),
    /// joined with `,` so they can be appended to a base filter string.
    pub fn directives(&self) -> String {
        self.modules
            .iter()
            .map(|(target, level)| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(default = "default_idle_timeout_try")]
    pub idle_timeout_try: f64,
    #[serde(default = "default_idle_timeout_force")]
    pub idle_timeout_force: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_try: default_idle_timeout_try(),
            idle_timeout_force: default_idle_timeout_force(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_timeout_try(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_try)
    }

    pub fn idle_timeout_force(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_force)
    }
}

impl Config {
    /// Loads `path` if it exists, otherwise falls back to defaults -
    /// matching the original's behavior of requiring a file only once
    /// deployed, not during local experimentation.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_yaml::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    /// Reads the per-game rules file (`<rules_dir>/<game>.txt`), if
    /// configured and present.
    pub fn rules_for(&self, game: &str) -> Option<String> {
        let dir = self.rules_dir.as_ref()?;
        let path = dir.join(format!("{game}.txt"));
        std::fs::read_to_string(&path).ok()
    }
}

mod socket_addr_str {
    use std::net::SocketAddr;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source() {
        let config = Config::default();
        assert_eq!(config.gary.scheduler.idle_timeout_try, 5.0);
        assert_eq!(config.gary.scheduler.idle_timeout_force, 30.0);
        assert!(!config.gary.allow_yapping);
        assert!(config.gary.enforce_schema);
        assert_eq!(config.gary.existing_connection_policy, ConflictPolicy::DropExisting);
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "gary:\n  allow_yapping: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.gary.allow_yapping);
        assert_eq!(config.gary.scheduler.idle_timeout_try, 5.0);
    }

    #[test]
    fn rules_for_missing_game_is_none() {
        let config = Config {
            rules_dir: Some(PathBuf::from("/nonexistent/path/for/gateway/rules")),
            ..Config::default()
        };
        assert!(config.rules_for("no-such-game").is_none());
    }
}
