//! Configuration management for the value cache
//!
//! TOML file support, environment variable overrides, and defaults matching the
//! usual monitoring server deployment (24 hour item expiry, 5 minute low-memory
//! warning interval).
//!
//! ```toml
//! size = "64M"
//! item_expire_period = 86400
//! ```

use crate::error::{Error, Result, ValidationError};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Smallest non-zero cache size accepted
pub const MIN_CACHE_SIZE: u64 = 128 * 1024;

/// Largest cache size accepted
pub const MAX_CACHE_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Value cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Memory budget in bytes; 0 turns the cache off
    #[serde(default = "default_size", deserialize_with = "deserialize_size")]
    pub size: u64,

    /// Items not accessed for this many seconds are dropped first under memory
    /// pressure and on the next write
    #[serde(default = "default_day")]
    pub item_expire_period: i64,

    /// Minimum interval between low-memory warnings, in seconds
    #[serde(default = "default_warning_period")]
    pub low_memory_warning_period: i64,

    /// Quiet period after which low-memory mode switches back to normal, in seconds
    #[serde(default = "default_day")]
    pub low_memory_reset_period: i64,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_size() -> u64 {
    8 * 1024 * 1024
}
fn default_day() -> i64 {
    86_400
}
fn default_warning_period() -> i64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            item_expire_period: default_day(),
            low_memory_warning_period: default_warning_period(),
            low_memory_reset_period: default_day(),
            log_level: default_log_level(),
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given memory budget
    pub fn with_size(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(size) = std::env::var("VC_CACHE_SIZE") {
            self.size = parse_size(&size)?;
        }
        if let Ok(period) = std::env::var("VC_ITEM_EXPIRE_PERIOD") {
            if let Ok(p) = period.parse() {
                self.item_expire_period = p;
            }
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.size != 0 && !(MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&self.size) {
            return Err(ValidationError::OutOfRange {
                field: "size".to_string(),
                value: self.size.to_string(),
                min: MIN_CACHE_SIZE.to_string(),
                max: MAX_CACHE_SIZE.to_string(),
            }
            .into());
        }

        for (field, value) in [
            ("item_expire_period", self.item_expire_period),
            ("low_memory_warning_period", self.low_memory_warning_period),
            ("low_memory_reset_period", self.low_memory_reset_period),
        ] {
            if value <= 0 {
                return Err(ValidationError::OutOfRange {
                    field: field.to_string(),
                    value: value.to_string(),
                    min: "1".to_string(),
                    max: i64::MAX.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Parse a size with an optional K, M, G or T suffix (powers of 1024)
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = |message: &str| -> Error {
        ValidationError::InvalidFormat {
            field: "size".to_string(),
            message: format!("{}: '{}'", message, input),
        }
        .into()
    };

    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(invalid("unknown size suffix")),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };

    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid("not a number"))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("size overflows"))
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Bytes(u64),
        Text(String),
    }

    match RawSize::deserialize(deserializer)? {
        RawSize::Bytes(bytes) => Ok(bytes),
        RawSize::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.size, 8 * 1024 * 1024);
        assert_eq!(config.item_expire_period, 86_400);
        assert_eq!(config.low_memory_warning_period, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_size_is_valid() {
        assert!(CacheConfig::with_size(0).validate().is_ok());
    }

    #[test]
    fn test_size_limits() {
        assert!(CacheConfig::with_size(MIN_CACHE_SIZE - 1).validate().is_err());
        assert!(CacheConfig::with_size(MIN_CACHE_SIZE).validate().is_ok());
        assert!(CacheConfig::with_size(MAX_CACHE_SIZE + 1).validate().is_err());
    }

    #[test]
    fn test_invalid_period() {
        let mut config = CacheConfig::default();
        config.low_memory_reset_period = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("128K").unwrap(), 128 * 1024);
        assert_eq!(parse_size("8m").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_size(" 2G ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_toml_size_forms() {
        let config: CacheConfig = toml::from_str("size = \"64M\"").unwrap();
        assert_eq!(config.size, 64 * 1024 * 1024);

        let config: CacheConfig = toml::from_str("size = 262144").unwrap();
        assert_eq!(config.size, 262_144);
        assert_eq!(config.item_expire_period, 86_400);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valuecache.toml");

        let mut config = CacheConfig::with_size(1024 * 1024);
        config.item_expire_period = 3600;
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(loaded.size, 1024 * 1024);
        assert_eq!(loaded.item_expire_period, 3600);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("VC_CACHE_SIZE", "256K");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.size, 256 * 1024);
        std::env::remove_var("VC_CACHE_SIZE");
    }
}
