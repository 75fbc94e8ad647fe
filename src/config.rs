//! cache2 configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration constants
///
/// All tunables of the cache engine collected in one place.
pub mod defaults {
    /// Memory ceiling for entries held in memory: 1MB
    ///
    /// Deliberately small. Every reported change in memory consumption
    /// above this value triggers a purge pass on the management thread.
    pub const MEMORY_LIMIT_KB: u64 = 1024;

    /// Released chunks kept per file before they are freed
    pub const CACHED_CHUNKS_LIMIT: usize = 16;

    /// Entries doomed per management thread quantum
    pub const PURGE_BATCH_SIZE: usize = crate::constants::PURGE_BATCH_SIZE;

    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// cache2 configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Memory budget configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Eviction configuration
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Cache root directory
    ///
    /// `entries/` and `doomed/` are created below it on first use.
    /// When absent every entry silently operates memory-only.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// Memory budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Memory ceiling in KB (default: 1024)
    #[serde(default = "default_memory_limit_kb")]
    pub limit_kb: u64,

    /// Released chunks kept per file (default: 16)
    #[serde(default = "default_cached_chunks_limit")]
    pub cached_chunks_limit: usize,
}

fn default_memory_limit_kb() -> u64 {
    defaults::MEMORY_LIMIT_KB
}

fn default_cached_chunks_limit() -> usize {
    defaults::CACHED_CHUNKS_LIMIT
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_kb: default_memory_limit_kb(),
            cached_chunks_limit: default_cached_chunks_limit(),
        }
    }
}

/// Eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Entries doomed per management thread quantum (default: 50)
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: usize,
}

fn default_purge_batch_size() -> usize {
    defaults::PURGE_BATCH_SIZE
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            purge_batch_size: default_purge_batch_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl CacheConfig {
    /// Configuration persisting entries under `cache_dir`
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.cache_dir = Some(cache_dir.into());
        config
    }

    /// Memory ceiling in bytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory.limit_kb * 1024
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: CacheConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.limit_kb == 0 {
            return Err(ConfigError::ValidationError(
                "Memory limit must be greater than zero".to_string(),
            ));
        }

        if self.memory.cached_chunks_limit == 0 {
            return Err(ConfigError::ValidationError(
                "Cached chunks limit must be at least 1".to_string(),
            ));
        }

        if self.eviction.purge_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "Purge batch size must be greater than zero".to_string(),
            ));
        }

        if let Some(dir) = &self.storage.cache_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Cache directory cannot be empty".to_string(),
                ));
            }
        }

        match self.logging.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.storage.cache_dir.is_none());
        assert_eq!(config.memory.limit_kb, 1024);
        assert_eq!(config.memory_limit_bytes(), 1024 * 1024);
        assert_eq!(config.eviction.purge_batch_size, 50);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::default();

        assert!(config.validate().is_ok());

        config.memory.limit_kb = 0;
        assert!(config.validate().is_err());
        config.memory.limit_kb = 1024;

        config.memory.cached_chunks_limit = 0;
        assert!(config.validate().is_err());
        config.memory.cached_chunks_limit = 4;

        config.eviction.purge_batch_size = 0;
        assert!(config.validate().is_err());
        config.eviction.purge_batch_size = 50;

        config.logging.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = CacheConfig::with_cache_dir("/tmp/cache2-test");
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: CacheConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.cache_dir, deserialized.storage.cache_dir);
        assert_eq!(config.memory.limit_kb, deserialized.memory.limit_kb);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CacheConfig = toml::from_str("[memory]\nlimit_kb = 64\n").unwrap();
        assert_eq!(config.memory.limit_kb, 64);
        assert_eq!(config.memory.cached_chunks_limit, defaults::CACHED_CHUNKS_LIMIT);
        assert_eq!(config.eviction.purge_batch_size, defaults::PURGE_BATCH_SIZE);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache2.toml");

        let mut config = CacheConfig::with_cache_dir(dir.path().join("cache"));
        config.memory.limit_kb = 2048;
        config.to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(loaded.memory.limit_kb, 2048);
        assert_eq!(loaded.storage.cache_dir, config.storage.cache_dir);
    }
}
