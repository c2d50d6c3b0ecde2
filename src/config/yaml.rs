//! YAML configuration parsing.
//!
//! Parses the configuration of one crond replica. Durations are written the
//! way schedules write them (`"30s"`, `"10m"`, `"168h"`, `"1d"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::api::ApiConfig;
use crate::coordination::{DEFAULT_LOCK_NAMESPACE, DEFAULT_SIGNAL_PREFIX};
use crate::core::schedule::Schedule;
use crate::daemon::{CompensatorOptions, CrondOptions, DEFAULT_MAX_INSTANTS};
use crate::engine::DEFAULT_LOCK_HOLD;

/// Serde adapter for humane duration strings.
mod humane {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    use crate::core::schedule::parse_duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => parse_duration(&raw).map(Some).map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Definition store backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Coordination store backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinationConfig {
    /// Process-local store; only one replica can participate.
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// etcd cluster.
    #[serde(rename = "etcd")]
    Etcd { endpoints: Vec<String> },
}

/// Build-cache GC settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub cron: String,
    /// Records unused for longer than this are collected.
    #[serde(with = "humane")]
    pub expire_in: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 0 * * *".to_string(),
            expire_in: Duration::from_secs(168 * 3600),
        }
    }
}

/// Interrupt compensation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensatorConfig {
    pub enabled: bool,
    pub cron: String,
    #[serde(with = "humane")]
    pub grace: Duration,
    pub max_instants: usize,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 */10 * * * *".to_string(),
            grace: Duration::from_secs(300),
            max_instants: DEFAULT_MAX_INSTANTS,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        let api = ApiConfig::default();
        Self {
            enabled: true,
            host: api.host,
            port: api.port,
        }
    }
}

/// Configuration of one crond replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrondConfig {
    /// Identity written into held lock keys; generated when absent.
    pub instance_id: Option<String>,
    pub storage: StorageConfig,
    pub coordination: CoordinationConfig,
    pub signal_prefix: String,
    pub lock_namespace: String,
    /// Lease of etcd lock keys.
    #[serde(with = "humane")]
    pub lock_ttl: Duration,
    /// Minimum time a lock key is kept after its trigger instant.
    #[serde(with = "humane")]
    pub lock_hold: Duration,
    /// Run-as user for definitions that name none.
    pub system_user_id: String,
    #[serde(with = "humane")]
    pub watch_retry: Duration,
    #[serde(with = "humane::option")]
    pub reload_interval: Option<Duration>,
    pub build_cache_gc: GcConfig,
    pub compensator: CompensatorConfig,
    pub api: ApiSection,
}

impl Default for CrondConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            storage: StorageConfig::default(),
            coordination: CoordinationConfig::default(),
            signal_prefix: DEFAULT_SIGNAL_PREFIX.to_string(),
            lock_namespace: DEFAULT_LOCK_NAMESPACE.to_string(),
            lock_ttl: Duration::from_secs(600),
            lock_hold: DEFAULT_LOCK_HOLD,
            system_user_id: "1000".to_string(),
            watch_retry: Duration::from_secs(5),
            reload_interval: None,
            build_cache_gc: GcConfig::default(),
            compensator: CompensatorConfig::default(),
            api: ApiSection::default(),
        }
    }
}

impl CrondConfig {
    /// Daemon options derived from this configuration.
    pub fn crond_options(&self) -> CrondOptions {
        CrondOptions {
            signal_prefix: self.signal_prefix.clone(),
            system_user_id: self.system_user_id.clone(),
            gc_cron: self.build_cache_gc.cron.clone(),
            gc_expire_in: self.build_cache_gc.expire_in,
            compensator: self.compensator.enabled.then(|| CompensatorOptions {
                cron: self.compensator.cron.clone(),
                grace: self.compensator.grace,
                max_instants: self.compensator.max_instants,
            }),
            watch_retry: self.watch_retry,
            reload_interval: self.reload_interval,
            lock_hold: self.lock_hold,
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.api.host.clone(), self.api.port)
    }
}

/// YAML configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<CrondConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CrondConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<CrondConfig, ConfigError> {
        let config: CrondConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    pub fn validate(config: &CrondConfig) -> Result<(), ConfigError> {
        let signal_prefix = config.signal_prefix.trim_end_matches('/');
        let lock_namespace = config.lock_namespace.trim_end_matches('/');
        if signal_prefix.is_empty() {
            return Err(ConfigError::MissingField("signal_prefix".into()));
        }
        if lock_namespace.is_empty() {
            return Err(ConfigError::MissingField("lock_namespace".into()));
        }
        // Lock keys under the signal prefix would reach the watch loop.
        if lock_namespace == signal_prefix
            || lock_namespace.starts_with(&format!("{}/", signal_prefix))
        {
            return Err(ConfigError::InvalidConfig(format!(
                "lock_namespace '{}' must not be inside signal_prefix '{}'",
                config.lock_namespace, config.signal_prefix
            )));
        }

        match &config.storage {
            StorageConfig::Sqlite { path } if path.trim().is_empty() => {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
            _ => {}
        }
        match &config.coordination {
            CoordinationConfig::Etcd { endpoints } if endpoints.is_empty() => {
                return Err(ConfigError::MissingField("coordination.endpoints".into()));
            }
            _ => {}
        }

        Schedule::new(&config.build_cache_gc.cron).map_err(|e| {
            ConfigError::InvalidConfig(format!("build_cache_gc.cron: {}", e))
        })?;
        if config.compensator.enabled {
            Schedule::new(&config.compensator.cron).map_err(|e| {
                ConfigError::InvalidConfig(format!("compensator.cron: {}", e))
            })?;
            if config.compensator.max_instants == 0 {
                return Err(ConfigError::InvalidConfig(
                    "compensator.max_instants cannot be zero".into(),
                ));
            }
        }
        if config.lock_ttl.is_zero() {
            return Err(ConfigError::InvalidConfig("lock_ttl cannot be zero".into()));
        }
        if config.watch_retry.is_zero() {
            return Err(ConfigError::InvalidConfig("watch_retry cannot be zero".into()));
        }
        if config.reload_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidConfig(
                "reload_interval cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = ConfigLoader::parse("{}").unwrap();
        assert_eq!(config, CrondConfig::default());
        assert_eq!(config.signal_prefix, DEFAULT_SIGNAL_PREFIX);
        assert_eq!(config.lock_ttl, Duration::from_secs(600));
        assert!(config.crond_options().compensator.is_some());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
instance_id: replica-a
storage:
  type: sqlite
  path: /var/lib/pipecron/crons.db
coordination:
  type: etcd
  endpoints:
    - http://etcd-0:2379
    - http://etcd-1:2379
signal_prefix: /pipeline/crond
lock_namespace: /pipeline/dlock
lock_ttl: 10m
system_user_id: "2000"
watch_retry: 3s
reload_interval: 1h
build_cache_gc:
  cron: "0 0 3 * * *"
  expire_in: 7d
compensator:
  enabled: false
api:
  host: 0.0.0.0
  port: 9000
"#;
        let config = ConfigLoader::parse(yaml).unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("replica-a"));
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: "/var/lib/pipecron/crons.db".to_string()
            }
        );
        match &config.coordination {
            CoordinationConfig::Etcd { endpoints } => assert_eq!(endpoints.len(), 2),
            other => panic!("Expected etcd coordination, got {:?}", other),
        }
        assert_eq!(config.lock_ttl, Duration::from_secs(600));
        assert_eq!(config.reload_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.build_cache_gc.expire_in, Duration::from_secs(7 * 86400));

        let options = config.crond_options();
        assert_eq!(options.signal_prefix, "/pipeline/crond");
        assert_eq!(options.system_user_id, "2000");
        assert_eq!(options.watch_retry, Duration::from_secs(3));
        assert!(options.compensator.is_none());
        assert_eq!(config.api_config().port, 9000);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let result = ConfigLoader::parse("lock_ttl: soon\n");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_invalid_gc_cron_is_rejected() {
        let result = ConfigLoader::parse("build_cache_gc:\n  cron: \"not a cron\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("build_cache_gc")));
    }

    #[test]
    fn test_disabled_compensator_cron_is_not_checked() {
        let yaml = "compensator:\n  enabled: false\n  cron: \"bogus\"\n";
        assert!(ConfigLoader::parse(yaml).is_ok());
    }

    #[test]
    fn test_lock_namespace_inside_signal_prefix_is_rejected() {
        let yaml = "signal_prefix: /crond\nlock_namespace: /crond/locks\n";
        assert!(matches!(
            ConfigLoader::parse(yaml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_backend_fields() {
        let yaml = "coordination:\n  type: etcd\n  endpoints: []\n";
        assert!(matches!(
            ConfigLoader::parse(yaml),
            Err(ConfigError::MissingField(field)) if field == "coordination.endpoints"
        ));

        let yaml = "storage:\n  type: sqlite\n  path: \"\"\n";
        assert!(matches!(
            ConfigLoader::parse(yaml),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "system_user_id: \"7\"\nwatch_retry: 1m").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.system_user_id, "7");
        assert_eq!(config.watch_retry, Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::load("/nonexistent/pipecron.yaml");
        assert!(matches!(result, Err(ConfigError::FileReadError { .. })));
    }
}
