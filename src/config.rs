//! Configuration management for pipesync.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (PIPESYNC_UNROLL, etc.)
//! 2. Project-local config file (`./pipesync.toml`)
//! 3. User config file (`~/.config/pipesync/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # pipesync.toml
//!
//! # Unroll factor for loops that do not request one
//! default_unroll = 2
//!
//! # Replace every pipe pair's event pool size
//! event_pool_size = 4
//! ```

use crate::schedule::hazards::default_analysis_iterations;
use crate::target::spec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// pipesync configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Unroll factor applied to loops without an explicit one.
    pub default_unroll: Option<u32>,

    /// Event identities per pipe pair, overriding the target's pool.
    pub event_pool_size: Option<u8>,

    /// Iterations of each loop expanded during hazard analysis.
    pub analysis_iterations: Option<u32>,

    /// Cap on known trip counts during plan verification.
    pub verify_trip_cap: Option<u64>,

    /// Batch counts tried for symbolic loops during plan verification.
    pub symbolic_trips: Option<Vec<u64>>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `pipesync.toml`
    /// 3. User config `~/.config/pipesync/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it. Only the binary uses
    /// this; library callers pass a `Config` explicitly.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    pub fn default_unroll(&self) -> u32 {
        self.default_unroll.unwrap_or(1).max(1)
    }

    /// Pool override, if any.
    pub fn event_pool_size(&self) -> Option<u8> {
        self.event_pool_size
    }

    pub fn analysis_iterations(&self) -> u32 {
        self.analysis_iterations
            .unwrap_or(default_analysis_iterations() as u32)
            .max(1)
    }

    pub fn verify_trip_cap(&self) -> u64 {
        self.verify_trip_cap
            .unwrap_or(spec::DEFAULT_VERIFY_TRIP_CAP as u64)
            .max(1)
    }

    pub fn symbolic_trips(&self) -> Vec<u64> {
        self.symbolic_trips
            .clone()
            .unwrap_or_else(|| spec::DEFAULT_SYMBOLIC_TRIPS.to_vec())
    }

    /// Load user configuration from ~/.config/pipesync/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./pipesync.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("pipesync.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("pipesync.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.default_unroll.is_some() {
            self.default_unroll = other.default_unroll;
        }
        if other.event_pool_size.is_some() {
            self.event_pool_size = other.event_pool_size;
        }
        if other.analysis_iterations.is_some() {
            self.analysis_iterations = other.analysis_iterations;
        }
        if other.verify_trip_cap.is_some() {
            self.verify_trip_cap = other.verify_trip_cap;
        }
        if other.symbolic_trips.is_some() {
            self.symbolic_trips = other.symbolic_trips;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_number("PIPESYNC_UNROLL") {
            self.default_unroll = Some(v);
        }
        if let Some(v) = env_number("PIPESYNC_EVENT_POOL") {
            self.event_pool_size = Some(v);
        }
        if let Some(v) = env_number("PIPESYNC_ANALYSIS_ITERATIONS") {
            self.analysis_iterations = Some(v);
        }
        if let Some(v) = env_number("PIPESYNC_VERIFY_TRIP_CAP") {
            self.verify_trip_cap = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pipesync").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# pipesync configuration
# Place this file at ~/.config/pipesync/config.toml or ./pipesync.toml

# Unroll factor for loops that do not request one (reduced when illegal)
default_unroll = 1

# Event identities per pipe pair, replacing the target's pool sizes
# event_pool_size = 8

# Loop iterations expanded during hazard analysis
# analysis_iterations = 12

# Known trip counts above this are truncated during verification
# verify_trip_cap = 64

# Batch counts tried for symbolic loops during verification
# symbolic_trips = [0, 1, 3, 8]
"#
        .to_string()
    }
}

fn env_number<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => {
            log::info!("Using {} from environment: {}", name, raw);
            Some(value)
        }
        Err(_) => {
            log::warn!("Ignoring {}: '{}' is not a valid number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.default_unroll(), 1);
        assert_eq!(config.event_pool_size(), None);
        assert_eq!(config.analysis_iterations(), 12);
        assert_eq!(config.verify_trip_cap(), 64);
        assert_eq!(config.symbolic_trips(), vec![0, 1, 3, 8]);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            default_unroll: Some(2),
            event_pool_size: Some(6),
            ..Default::default()
        };

        let overlay = Config {
            event_pool_size: Some(4),
            symbolic_trips: Some(vec![2]),
            ..Default::default()
        };

        base.merge(overlay);

        // default_unroll unchanged (overlay was None)
        assert_eq!(base.default_unroll, Some(2));
        assert_eq!(base.event_pool_size, Some(4));
        assert_eq!(base.symbolic_trips(), vec![2]);
    }

    #[test]
    fn test_zero_unroll_clamped() {
        let config = Config {
            default_unroll: Some(0),
            ..Default::default()
        };
        assert_eq!(config.default_unroll(), 1);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.default_unroll, Some(1));
    }
}
