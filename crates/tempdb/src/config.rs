//! File and environment configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TempDbError};
use crate::uri::{ParamValue, Params};
use crate::version::Version;

pub const ENV_BIN_DIR: &str = "TEMPDB_PG_BIN";
pub const ENV_VERSION: &str = "TEMPDB_PG_VERSION";
pub const ENV_SUPERUSER: &str = "TEMPDB_SUPERUSER";
pub const ENV_STARTUP_TIMEOUT: &str = "TEMPDB_STARTUP_TIMEOUT_SECS";

/// Settings for locating an installation and starting instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempDbConfig {
    /// Explicit bin directory; discovery is skipped when set
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Version hint for discovery (`"16"`, `"14.11"`)
    #[serde(default)]
    pub version: Option<String>,

    /// Cluster superuser; defaults to the current OS user
    #[serde(default)]
    pub superuser: Option<String>,

    /// Readiness wait bound in seconds, 0 waits forever
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between socket readiness checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Extra `-c key=value` settings for every started server
    #[serde(default)]
    pub server_params: BTreeMap<String, ConfigParam>,
}

/// A server setting as written in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&ConfigParam> for ParamValue {
    fn from(param: &ConfigParam) -> Self {
        match param {
            ConfigParam::Bool(b) => ParamValue::Bool(*b),
            ConfigParam::Int(i) => ParamValue::Text(i.to_string()),
            ConfigParam::Float(f) => ParamValue::Text(f.to_string()),
            ConfigParam::Text(s) => ParamValue::Text(s.clone()),
        }
    }
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for TempDbConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            version: None,
            superuser: None,
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
            server_params: BTreeMap::new(),
        }
    }
}

impl TempDbConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TempDbConfig = toml::from_str(&content)
            .map_err(|e| TempDbError::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TempDbError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overlaid with `TEMPDB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an environment lookup function.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_BIN_DIR).filter(|v| !v.is_empty()) {
            self.bin_dir = Some(PathBuf::from(dir));
        }
        if let Some(version) = lookup(ENV_VERSION).filter(|v| !v.is_empty()) {
            self.version = Some(version);
        }
        if let Some(user) = lookup(ENV_SUPERUSER).filter(|v| !v.is_empty()) {
            self.superuser = Some(user);
        }
        if let Some(secs) = lookup(ENV_STARTUP_TIMEOUT).filter(|v| !v.is_empty()) {
            self.startup_timeout_secs = secs.trim().parse().map_err(|_| {
                TempDbError::config(format!("{ENV_STARTUP_TIMEOUT} must be a number of seconds, got {secs:?}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        self.version_hint()?;
        if self.poll_interval_ms == 0 {
            return Err(TempDbError::config("poll_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Parsed version hint, if any.
    pub fn version_hint(&self) -> Result<Option<Version>> {
        self.version
            .as_deref()
            .map(|v| {
                v.parse::<Version>()
                    .map_err(|_| TempDbError::config(format!("invalid version hint {v:?}")))
            })
            .transpose()
    }

    /// `None` means wait for readiness without bound.
    pub fn startup_timeout(&self) -> Option<Duration> {
        match self.startup_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured server settings in key order.
    pub fn server_params(&self) -> Params {
        self.server_params
            .iter()
            .map(|(k, v)| (k.clone(), ParamValue::from(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TempDbConfig::default();
        assert!(config.bin_dir.is_none());
        assert_eq!(config.startup_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.server_params().is_empty());
    }

    #[test]
    fn test_load_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tempdb.toml");
        std::fs::write(
            &path,
            r#"
version = "16"
superuser = "tester"
startup_timeout_secs = 0

[server_params]
fsync = false
shared_buffers = "16MB"
max_connections = 20
"#,
        )
        .unwrap();

        let config = TempDbConfig::load(&path).unwrap();
        assert_eq!(config.version_hint().unwrap(), Some(Version::from(16)));
        assert_eq!(config.superuser.as_deref(), Some("tester"));
        assert_eq!(config.startup_timeout(), None);
        assert_eq!(config.poll_interval_ms, 100);

        let params = config.server_params();
        let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        assert_eq!(
            rendered,
            vec!["fsync=off", "max_connections=20", "shared_buffers=16MB"]
        );
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tempdb.toml");
        let mut config = TempDbConfig {
            bin_dir: Some(PathBuf::from("/usr/lib/postgresql/16/bin")),
            ..Default::default()
        };
        config
            .server_params
            .insert("fsync".to_string(), ConfigParam::Bool(false));
        config.save(&path).unwrap();

        let loaded = TempDbConfig::load(&path).unwrap();
        assert_eq!(loaded.bin_dir, config.bin_dir);
        assert_eq!(loaded.server_params, config.server_params);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tempdb.toml");
        std::fs::write(&path, "version = \"latest\"\n").unwrap();
        assert!(matches!(
            TempDbConfig::load(&path),
            Err(TempDbError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BIN_DIR, "/opt/pg/bin"),
            (ENV_VERSION, "15.6"),
            (ENV_SUPERUSER, "ci"),
            (ENV_STARTUP_TIMEOUT, "5"),
        ]
        .into_iter()
        .collect();

        let config = TempDbConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bin_dir, Some(PathBuf::from("/opt/pg/bin")));
        assert_eq!(config.version_hint().unwrap().unwrap().to_string(), "15.6");
        assert_eq!(config.superuser.as_deref(), Some("ci"));
        assert_eq!(config.startup_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_env_bad_timeout() {
        let result = TempDbConfig::default()
            .with_env_overrides(|k| (k == ENV_STARTUP_TIMEOUT).then(|| "soon".to_string()));
        assert!(matches!(result, Err(TempDbError::Config(_))));
    }
}
