//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/shopsync/config.toml)
//! 3. Environment variables (SHOPSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compression::CompressionOptions;
use crate::conflict::{ResolutionStrategy, ResolverConfig};
use crate::models::EntityType;
use crate::retry::RetryProfile;
use crate::storage::fs::atomic_write;

/// Environment variable prefix
const ENV_PREFIX: &str = "SHOPSYNC";

/// Sync cycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Operations per upload batch
    pub batch_size: usize,
    /// Entities requested per delta page
    pub delta_page_limit: u32,
    /// Periodic sync interval while online
    pub sync_interval_secs: u64,
    /// Upper bound on a whole cycle
    pub cycle_timeout_secs: u64,
    /// Transient failures tolerated before an operation is dead-lettered
    pub max_operation_retries: u32,
    /// Entity types pulled during delta download
    pub entity_types: Vec<EntityType>,
    /// Retry policy for batch upload and delta download calls
    pub retry_profile: RetryProfile,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delta_page_limit: 500,
            sync_interval_secs: 15 * 60,
            cycle_timeout_secs: 120,
            max_operation_retries: 10,
            entity_types: EntityType::ALL.to_vec(),
            retry_profile: RetryProfile::Sync,
        }
    }
}

impl SyncSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

/// Connectivity monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
    /// Window in which repeated reconnections fire only one notification
    pub debounce_ms: u64,
    /// How often the HTTP probe checks the server
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

impl ConnectivitySettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the queue database and state files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sync server base URL
    #[serde(default)]
    pub server_url: Option<String>,

    /// Bearer token for the sync API
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Stable device identifier, generated on first use when unset
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub compression: CompressionOptions,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,

    /// Conflict resolution strategy selection
    #[serde(default)]
    pub conflicts: ResolverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_url: None,
            auth_token: None,
            device_id: None,
            user_id: None,
            sync_enabled: false,
            log_file: None,
            sync: SyncSettings::default(),
            compression: CompressionOptions::default(),
            connectivity: ConnectivitySettings::default(),
            conflicts: ResolverConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SHOPSYNC_DATA_DIR, SHOPSYNC_SERVER_URL, ...)
    /// 2. Config file (~/.config/shopsync/config.toml or SHOPSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok();
        let non_empty = |val: String| if val.is_empty() { None } else { Some(val) };

        if let Some(val) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = var("SERVER_URL") {
            self.server_url = non_empty(val);
        }
        if let Some(val) = var("AUTH_TOKEN") {
            self.auth_token = non_empty(val);
        }
        if let Some(val) = var("DEVICE_ID") {
            self.device_id = non_empty(val);
        }
        if let Some(val) = var("USER_ID") {
            self.user_id = non_empty(val);
        }
        if let Some(val) = var("SYNC_ENABLED") {
            self.sync_enabled = parse_bool(&val);
        }
        if let Some(val) = var("LOG_FILE") {
            self.log_file = non_empty(val).map(PathBuf::from);
        }
        if let Some(n) = var("BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.sync.batch_size = n;
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Set a single key by its dotted name (`sync.batch_size`, `server_url`, ...)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let opt = |v: &str| if v.is_empty() { None } else { Some(v.to_string()) };
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "server_url" => self.server_url = opt(value),
            "auth_token" => self.auth_token = opt(value),
            "device_id" => self.device_id = opt(value),
            "user_id" => self.user_id = opt(value),
            "sync_enabled" => self.sync_enabled = parse_bool(value),
            "log_file" => self.log_file = opt(value).map(PathBuf::from),
            "sync.batch_size" => self.sync.batch_size = parse_num(key, value)?,
            "sync.delta_page_limit" => self.sync.delta_page_limit = parse_num(key, value)?,
            "sync.sync_interval_secs" => self.sync.sync_interval_secs = parse_num(key, value)?,
            "sync.cycle_timeout_secs" => self.sync.cycle_timeout_secs = parse_num(key, value)?,
            "sync.max_operation_retries" => {
                self.sync.max_operation_retries = parse_num(key, value)?
            }
            "sync.retry_profile" => {
                self.sync.retry_profile = match value {
                    "default" => RetryProfile::Default,
                    "aggressive" => RetryProfile::Aggressive,
                    "conservative" => RetryProfile::Conservative,
                    "sync" => RetryProfile::Sync,
                    _ => bail!("Unknown retry profile: {}", value),
                }
            }
            "conflicts.default_strategy" => {
                self.conflicts.default_strategy = value
                    .parse::<ResolutionStrategy>()
                    .map_err(|e| anyhow::anyhow!("{}", e))?
            }
            "conflicts.max_resolution_attempts" => {
                self.conflicts.max_resolution_attempts = parse_num(key, value)?
            }
            "compression.enabled" => self.compression.enabled = parse_bool(value),
            "compression.level" => self.compression.level = parse_num(key, value)?,
            "compression.threshold_bytes" => {
                self.compression.threshold_bytes = parse_num(key, value)?
            }
            "connectivity.debounce_ms" => self.connectivity.debounce_ms = parse_num(key, value)?,
            "connectivity.probe_interval_secs" => {
                self.connectivity.probe_interval_secs = parse_num(key, value)?
            }
            "connectivity.probe_timeout_secs" => {
                self.connectivity.probe_timeout_secs = parse_num(key, value)?
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SHOPSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shopsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database (queue, conflicts, local store)
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    /// Get the path to the persisted retry history
    pub fn retry_history_path(&self) -> PathBuf {
        self.data_dir.join("retry_history.json")
    }

    /// Get the path to the generated device id file
    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    /// Return the configured device id, or a generated one persisted in the data dir
    pub fn resolve_device_id(&self) -> Result<String> {
        if let Some(id) = &self.device_id {
            return Ok(id.clone());
        }

        let path = self.device_id_path();
        if path.exists() {
            let id = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read device id: {:?}", path))?;
            let id = id.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }

        let id = Uuid::new_v4().to_string();
        atomic_write(&path, id.as_bytes())
            .with_context(|| format!("Failed to write device id: {:?}", path))?;
        Ok(id)
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number for {}: '{}'", key, value))
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shopsync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "SHOPSYNC_DATA_DIR",
        "SHOPSYNC_SERVER_URL",
        "SHOPSYNC_AUTH_TOKEN",
        "SHOPSYNC_DEVICE_ID",
        "SHOPSYNC_USER_ID",
        "SHOPSYNC_SYNC_ENABLED",
        "SHOPSYNC_LOG_FILE",
        "SHOPSYNC_BATCH_SIZE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.server_url.is_none());
        assert!(config.data_dir.ends_with("shopsync"));
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.sync_interval(), Duration::from_secs(900));
        assert_eq!(config.sync.cycle_timeout(), Duration::from_secs(120));
        assert_eq!(config.compression.threshold_bytes, 1024);
        assert_eq!(config.sync.entity_types.len(), 3);
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.database_path().ends_with("queue.db"));
        assert!(config.retry_history_path().ends_with("retry_history.json"));
        assert!(config.device_id_path().ends_with("device_id"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("SHOPSYNC_DATA_DIR", "/tmp/shopsync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/shopsync-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("SHOPSYNC_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("SHOPSYNC_SYNC_ENABLED", "0");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_server_url_and_batch_size() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("SHOPSYNC_SERVER_URL", "https://api.example.com");
        env::set_var("SHOPSYNC_BATCH_SIZE", "20");
        config.apply_env_overrides();
        assert_eq!(config.server_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.sync.batch_size, 20);

        // Empty string clears it, garbage numbers are ignored
        env::set_var("SHOPSYNC_SERVER_URL", "");
        env::set_var("SHOPSYNC_BATCH_SIZE", "many");
        config.apply_env_overrides();
        assert!(config.server_url.is_none());
        assert_eq!(config.sync.batch_size, 20);
    }

    #[test]
    fn test_load_from_str_with_sections() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            server_url = "https://api.example.com"
            sync_enabled = true

            [sync]
            batch_size = 25
            entity_types = ["sale", "product"]

            [compression]
            enabled = false

            [connectivity]
            debounce_ms = 2000

            [conflicts]
            default_strategy = "server_wins"

            [conflicts.by_entity_type]
            sale = "manual"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert!(config.sync_enabled);
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.max_operation_retries, 10);
        assert_eq!(
            config.sync.entity_types,
            vec![EntityType::Sale, EntityType::Product]
        );
        assert!(!config.compression.enabled);
        assert_eq!(config.compression.level, 6);
        assert_eq!(config.connectivity.debounce(), Duration::from_secs(2));
        assert_eq!(config.sync.retry_profile, RetryProfile::Sync);
        assert_eq!(
            config.conflicts.default_strategy,
            ResolutionStrategy::ServerWins
        );
        assert_eq!(
            config.conflicts.by_entity_type.get("sale"),
            Some(&ResolutionStrategy::Manual)
        );
        assert_eq!(config.conflicts.max_resolution_attempts, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config {
            data_dir: temp_dir.path().join("data"),
            ..Default::default()
        };
        config.set("server_url", "https://api.example.com").unwrap();
        config.set("sync.batch_size", "10").unwrap();
        config.set("compression.enabled", "false").unwrap();
        config.set("sync.retry_profile", "aggressive").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.server_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(loaded.sync.batch_size, 10);
        assert!(!loaded.compression.enabled);
        assert_eq!(loaded.sync.retry_profile, RetryProfile::Aggressive);
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_set_rejects_unknown_key_and_bad_number() {
        let mut config = Config::default();
        assert!(config.set("nope", "1").is_err());
        assert!(config.set("sync.batch_size", "lots").is_err());
    }

    #[test]
    fn test_resolve_device_id_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        let first = config.resolve_device_id().unwrap();
        let second = config.resolve_device_id().unwrap();
        assert_eq!(first, second);

        let explicit = Config {
            device_id: Some("till-3".to_string()),
            ..config
        };
        assert_eq!(explicit.resolve_device_id().unwrap(), "till-3");
    }
}
