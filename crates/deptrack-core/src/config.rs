//! Configuration system for the dependency collector
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use crate::propagation::HeaderInjection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete collector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent settings
    pub agent: AgentSettings,

    /// Correlation store settings
    pub store: StoreSettings,

    /// Correlation-id resolver settings
    pub resolver: ResolverSettings,

    /// HTTP tracking settings
    pub http: HttpSettings,

    /// SQL tracking settings
    pub sql: SqlSettings,

    /// Export settings
    pub export: ExportSettings,
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Instrumentation key of this application
    pub instrumentation_key: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            instrumentation_key: None,
        }
    }
}

/// Which correlation store backs the trackers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Synthetic keys, bounded entry count with eviction
    Capacity,
    /// Call-object identity, entries live as long as the call
    Identity,
}

impl FromStr for StoreMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "capacity" => Ok(StoreMode::Capacity),
            "identity" => Ok(StoreMode::Identity),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid store mode: {}. Must be one of: [\"capacity\", \"identity\"]",
                other
            ))),
        }
    }
}

/// Correlation store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub mode: StoreMode,

    /// Maximum open records (capacity mode)
    pub max_entries: usize,

    /// Optional byte budget for open records (capacity mode)
    pub max_bytes: Option<usize>,

    /// Inserts between sweeps of dead call objects (identity mode)
    pub sweep_interval: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            mode: StoreMode::Capacity,
            max_entries: 100_000,
            max_bytes: None,
            sweep_interval: 1024,
        }
    }
}

/// Longest a resolver cache entry may live, in seconds
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Correlation-id resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Enable cross-component resolution
    pub enabled: bool,

    /// Profile lookup endpoint
    pub endpoint: String,

    /// How long a resolved application id stays cached
    pub positive_ttl_secs: u64,

    /// How long a failed lookup stays cached
    pub negative_ttl_secs: u64,

    /// Lookup timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://dc.services.visualstudio.com".to_string(),
            positive_ttl_secs: 3600,
            negative_ttl_secs: 60,
            timeout_ms: 2000,
        }
    }
}

impl ResolverSettings {
    pub fn positive_ttl(&self) -> Duration {
        Duration::from_secs(self.positive_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// HTTP tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Telemetry ingestion endpoint; calls to it are never tracked
    pub ingestion_endpoint: String,

    /// Additional hosts whose calls are never tracked
    pub excluded_hosts: Vec<String>,

    /// Outgoing header injection
    pub injection: HeaderInjection,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            ingestion_endpoint: "https://dc.services.visualstudio.com/v2/track".to_string(),
            excluded_hosts: Vec::new(),
            injection: HeaderInjection::default(),
        }
    }
}

/// SQL tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlSettings {
    /// Report the command text in the telemetry data field
    pub capture_command_text: bool,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            capture_command_text: true,
        }
    }
}

/// Export settings container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Capacity of the in-process broadcast channel
    pub broadcast_capacity: usize,

    /// JSONL file output
    pub jsonl: JsonlExportConfig,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            jsonl: JsonlExportConfig::default(),
        }
    }
}

/// JSONL export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlExportConfig {
    /// Enable JSONL export
    pub enabled: bool,

    /// Output file path
    pub path: String,

    /// Append to existing file
    pub append: bool,

    /// Flush after each record
    pub flush_each: bool,

    /// Pretty print JSON
    pub pretty: bool,
}

impl Default for JsonlExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/var/lib/deptrack/dependencies.jsonl".to_string(),
            append: true,
            flush_each: true,
            pretty: false,
        }
    }
}

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "DEPTRACK_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/deptrack/config.toml";

/// Finds, parses, overrides and validates an [`AgentConfig`]
#[derive(Debug, Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path given with `--config`; takes precedence over everything else
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    /// Resolve the effective configuration.
    ///
    /// The first existing file among the `--config` path, `$DEPTRACK_CONFIG`,
    /// the user config dir and `/etc/deptrack/config.toml` is parsed; with
    /// none of them present the defaults apply. `DEPTRACK_*` variables are
    /// applied on top and the result is validated.
    pub fn load(&self) -> ConfigResult<AgentConfig> {
        let mut config = match self.locate() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                AgentConfig::default()
            }
        };

        apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        self.validate(&config)?;
        Ok(config)
    }

    fn locate(&self) -> Option<PathBuf> {
        let explicit = [
            ("--config", self.explicit.clone()),
            (CONFIG_ENV, std::env::var_os(CONFIG_ENV).map(PathBuf::from)),
        ];
        for (origin, path) in explicit {
            let Some(path) = path else { continue };
            if path.exists() {
                return Some(path);
            }
            warn!("{} points at a missing file: {}", origin, path.display());
        }

        Self::default_config_path()
            .into_iter()
            .chain(cfg!(unix).then(|| PathBuf::from(SYSTEM_CONFIG_PATH)))
            .find(|path| path.exists())
    }

    /// Parse one TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<AgentConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn validate(&self, config: &AgentConfig) -> ConfigResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

        let level = config.agent.log_level.to_lowercase();
        let resolver = &config.resolver;
        let problem = if !LEVELS.contains(&level.as_str()) {
            Some(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.agent.log_level, LEVELS
            ))
        } else if config.store.max_entries == 0 {
            Some("store.max_entries cannot be 0".to_string())
        } else if config.store.max_bytes == Some(0) {
            Some("store.max_bytes cannot be 0".to_string())
        } else if resolver.enabled && resolver.timeout_ms == 0 {
            Some("resolver.timeout_ms cannot be 0".to_string())
        } else if resolver.enabled && resolver.positive_ttl_secs > MAX_CACHE_TTL_SECS {
            Some(format!(
                "resolver.positive_ttl_secs ({}) exceeds the maximum of {}",
                resolver.positive_ttl_secs, MAX_CACHE_TTL_SECS
            ))
        } else if resolver.enabled && resolver.negative_ttl_secs > resolver.positive_ttl_secs {
            Some(format!(
                "resolver.negative_ttl_secs ({}) must not exceed positive_ttl_secs ({})",
                resolver.negative_ttl_secs, resolver.positive_ttl_secs
            ))
        } else if config.export.broadcast_capacity == 0 {
            Some("export.broadcast_capacity cannot be 0".to_string())
        } else {
            None
        };

        match problem {
            Some(message) => Err(ConfigError::ValidationError(message)),
            None => Ok(()),
        }
    }

    /// Write `config` as TOML, creating parent directories
    pub fn save(&self, config: &AgentConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::ValidationError(format!("Unserializable config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        info!("Configuration written to {}", path.display());
        Ok(())
    }

    /// `<user config dir>/deptrack/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        user_config_dir().map(|dir| dir.join("deptrack").join("config.toml"))
    }
}

/// Apply `DEPTRACK_*` overrides read through `lookup`.
///
/// Values that fail to parse leave the setting untouched.
fn apply_env_overrides(config: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
        let raw = lookup(name)?;
        let value = raw.parse().ok();
        if value.is_none() {
            warn!("Ignoring unparsable {}={:?}", name, raw);
        }
        value
    }

    if let Some(level) = lookup("DEPTRACK_LOG_LEVEL") {
        config.agent.log_level = level;
    }
    if let Some(ikey) = lookup("DEPTRACK_INSTRUMENTATION_KEY") {
        config.agent.instrumentation_key = Some(ikey);
    }
    if let Some(mode) = parsed(&lookup, "DEPTRACK_STORE_MODE") {
        config.store.mode = mode;
    }
    if let Some(max) = parsed(&lookup, "DEPTRACK_STORE_MAX_ENTRIES") {
        config.store.max_entries = max;
    }
    if let Some(endpoint) = lookup("DEPTRACK_RESOLVER_ENDPOINT") {
        config.resolver.endpoint = endpoint;
    }
    if let Some(enabled) = parsed(&lookup, "DEPTRACK_RESOLVER_ENABLED") {
        config.resolver.enabled = enabled;
    }
    if let Some(endpoint) = lookup("DEPTRACK_INGESTION_ENDPOINT") {
        config.http.ingestion_endpoint = endpoint;
    }
    if let Some(path) = lookup("DEPTRACK_JSONL_PATH") {
        config.export.jsonl.path = path;
    }
    if let Some(enabled) = parsed(&lookup, "DEPTRACK_JSONL_ENABLED") {
        config.export.jsonl.enabled = enabled;
    }
}

/// Per-user configuration directory
fn user_config_dir() -> Option<PathBuf> {
    let home_config = || std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"));
    if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else if cfg!(target_os = "linux") {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(home_config)
    } else if cfg!(unix) {
        home_config()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.log_level, "info");
        assert_eq!(config.store.mode, StoreMode::Capacity);
        assert_eq!(config.store.max_entries, 100_000);
        assert!(config.resolver.enabled);
        assert!(config.resolver.negative_ttl() < config.resolver.positive_ttl());
        assert!(config.http.injection.w3c);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [agent]
            log_level = "debug"
        "#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.log_level, "debug");
        assert_eq!(config.store.mode, StoreMode::Capacity);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [agent]
            log_level = "trace"
            instrumentation_key = "ikey-1"

            [store]
            mode = "identity"
            max_entries = 500
            max_bytes = 1048576

            [resolver]
            endpoint = "http://profiles.local"
            positive_ttl_secs = 600
            negative_ttl_secs = 30

            [http]
            ingestion_endpoint = "http://ingest.local/v2/track"
            excluded_hosts = ["metadata.internal"]

            [http.injection]
            legacy = false

            [sql]
            capture_command_text = false

            [export.jsonl]
            path = "/tmp/deps.jsonl"
        "#;

        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.instrumentation_key.as_deref(), Some("ikey-1"));
        assert_eq!(config.store.mode, StoreMode::Identity);
        assert_eq!(config.store.max_entries, 500);
        assert_eq!(config.store.max_bytes, Some(1_048_576));
        assert_eq!(config.resolver.endpoint, "http://profiles.local");
        assert_eq!(config.resolver.negative_ttl(), Duration::from_secs(30));
        assert_eq!(config.http.excluded_hosts, vec!["metadata.internal"]);
        assert!(!config.http.injection.legacy);
        assert!(config.http.injection.w3c);
        assert!(!config.sql.capture_command_text);
        assert_eq!(config.export.jsonl.path, "/tmp/deps.jsonl");
    }

    #[test]
    fn test_store_mode_from_str() {
        assert_eq!("Identity".parse::<StoreMode>().unwrap(), StoreMode::Identity);
        assert!("weak".parse::<StoreMode>().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = AgentConfig {
            agent: AgentSettings {
                log_level: "invalid".to_string(),
                instrumentation_key: None,
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_zero_capacity() {
        let config = AgentConfig {
            store: StoreSettings {
                max_entries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_negative_ttl_longer_than_positive() {
        let config = AgentConfig {
            resolver: ResolverSettings {
                positive_ttl_secs: 10,
                negative_ttl_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_ttl_upper_bound() {
        let mut config = AgentConfig::default();
        config.resolver.positive_ttl_secs = u64::MAX;
        assert!(ConfigLoader::new().validate(&config).is_err());

        config.resolver.positive_ttl_secs = MAX_CACHE_TTL_SECS;
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars = std::collections::HashMap::from([
            ("DEPTRACK_STORE_MODE", "identity"),
            ("DEPTRACK_STORE_MAX_ENTRIES", "not-a-number"),
            ("DEPTRACK_RESOLVER_ENABLED", "false"),
            ("DEPTRACK_INSTRUMENTATION_KEY", "ikey-env"),
        ]);
        let mut config = AgentConfig::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.store.mode, StoreMode::Identity);
        assert_eq!(config.store.max_entries, 100_000);
        assert!(!config.resolver.enabled);
        assert_eq!(config.agent.instrumentation_key.as_deref(), Some("ikey-env"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::new().load_from_file(Path::new("/nonexistent/deptrack.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let loader = ConfigLoader::new();

        let mut config = AgentConfig::default();
        config.store.mode = StoreMode::Identity;
        loader.save(&config, &path).unwrap();

        let reloaded = loader.load_from_file(&path).unwrap();
        assert_eq!(reloaded.store.mode, StoreMode::Identity);
        assert!(toml::to_string_pretty(&reloaded).unwrap().contains("[store]"));
    }
}
