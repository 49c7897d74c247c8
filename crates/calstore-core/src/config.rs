use crate::error::CoreError;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Opaque properties whose encoded form exceeds this many bytes are not stored.
pub const DEFAULT_MAX_UNKNOWN_PROPERTY_SIZE: usize = 25_000;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
}

/// Where the local store lives and how large a single transaction may get.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Path of the SQLite database file
    pub database_path: PathBuf,
    /// Operations per transaction before the store reports it as too large
    pub max_batch_operations: usize,
    /// Estimated payload bytes per transaction before the store reports it as too large
    pub max_batch_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("calstore.db"),
            max_batch_operations: 500,
            max_batch_bytes: 1_000_000,
        }
    }
}

/// Settings consumed by the normalizer and the entity mapper
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MappingConfig {
    /// Zone substituted for unknown zone identifiers (IANA format)
    pub default_timezone: String,
    pub max_unknown_property_size: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            default_timezone: detect_system_timezone(),
            max_unknown_property_size: DEFAULT_MAX_UNKNOWN_PROPERTY_SIZE,
        }
    }
}

impl MappingConfig {
    /// The configured default zone, or UTC when the configured name is not a known zone.
    pub fn default_zone(&self) -> Tz {
        match Tz::from_str(&self.default_timezone) {
            Ok(tz) => tz,
            Err(_) => {
                log::warn!(
                    "Configured default time zone '{}' is unknown, using UTC",
                    self.default_timezone
                );
                Tz::UTC
            }
        }
    }
}

impl Config {
    /// Loads `calstore.toml` from the working directory, overridden by `CALSTORE_` variables.
    pub fn new() -> Result<Self, CoreError> {
        Self::from_file("calstore.toml")
    }

    /// Loads the given TOML file (missing files are skipped) with `CALSTORE_` overrides.
    ///
    /// Nested keys use a double underscore: `CALSTORE_STORAGE__MAX_BATCH_OPERATIONS=100`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Ok(Self::figment(path).extract()?)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CALSTORE_").split("__"))
    }
}

/// Validates that a timezone string is a valid IANA timezone name
pub fn validate_timezone(timezone: &str) -> Result<Tz, CoreError> {
    Tz::from_str(timezone).map_err(|_| {
        CoreError::InvalidInput(format!(
            "Invalid timezone: '{}'. Use IANA timezone names like 'Europe/Vienna'",
            timezone
        ))
    })
}

/// Detects the system timezone, falling back to UTC if detection fails
pub fn detect_system_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if validate_timezone(&tz).is_ok() {
            return tz;
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(tz) = std::fs::read_to_string("/etc/timezone") {
            let tz = tz.trim();
            if validate_timezone(tz).is_ok() {
                return tz.to_string();
            }
        }
    }

    if let Ok(local_tz) = iana_time_zone::get_timezone() {
        if validate_timezone(&local_tz).is_ok() {
            return local_tz;
        }
    }

    "UTC".to_string()
}
