#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Configuration for the flood map risk engine.
//!
//! The defaults live in `default.toml` and are embedded at compile time.
//! A user file can override any subset of keys, and a handful of keys
//! can be overridden from the environment:
//!
//! | Variable | Key |
//! |---|---|
//! | `OPENWEATHER_API_KEY` | `rainfall.api_key` |
//! | `FLOOD_MAP_DB_PATH` | `database.path` |
//! | `FLOOD_MAP_INTERVAL_SECS` | `scheduler.interval_secs` |
//! | `FLOOD_MAP_CACHE_TTL_SECS` | `rainfall.cache_ttl_secs` |
//!
//! Every loaded configuration is validated before it is returned, so
//! broken invariants (weights that do not sum to 1.0, zero thresholds)
//! fail at startup instead of mid-cycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Embedded default configuration.
const DEFAULT_TOML: &str = include_str!("../default.toml");

/// Allowed drift of the weight sum from 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML could not be parsed or did not match the schema.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value violates an invariant.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// Which invariant failed.
        message: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodMapConfig {
    /// Hotspot detection thresholds.
    pub hotspot: HotspotConfig,
    /// Risk model weights and normalization.
    pub risk: RiskConfig,
    /// Rainfall provider and cache.
    pub rainfall: RainfallConfig,
    /// Periodic recomputation.
    pub scheduler: SchedulerConfig,
    /// Persistent store.
    pub database: DatabaseConfig,
}

/// Hotspot detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HotspotConfig {
    /// Reports older than this many days are ignored.
    pub window_days: u32,
    /// Clustering neighborhood radius, in the units of stored points (degrees).
    pub eps_distance: f64,
    /// Minimum neighbors for a dense point, and minimum cluster size.
    pub min_points: usize,
    /// Minimum number of distinct calendar days in a cluster.
    pub min_distinct_days: usize,
}

/// The five risk weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    /// Weight of normalized rainfall.
    pub rainfall: f64,
    /// Weight of report recurrence.
    pub recurrence: f64,
    /// Weight of hotspot persistence.
    pub hotspot: f64,
    /// Weight of drainage stress.
    pub drainage: f64,
    /// Weight of population exposure.
    pub population: f64,
}

impl RiskWeights {
    /// Sum of all five weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.rainfall + self.recurrence + self.hotspot + self.drainage + self.population
    }

    fn as_array(&self) -> [(&'static str, f64); 5] {
        [
            ("rainfall", self.rainfall),
            ("recurrence", self.recurrence),
            ("hotspot", self.hotspot),
            ("drainage", self.drainage),
            ("population", self.population),
        ]
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            rainfall: 0.35,
            recurrence: 0.25,
            hotspot: 0.20,
            drainage: 0.10,
            population: 0.10,
        }
    }
}

/// Risk model weights and normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Rainfall (mm) that maps to a normalized value of 1.0.
    pub rainfall_ceiling_mm: f64,
    /// Trailing window for the recurrence rate.
    pub recurrence_window_days: u32,
    /// Report count in the trailing window that saturates recurrence.
    pub recurrence_saturation: f64,
    /// Hotspot count that saturates persistence.
    pub hotspot_saturation: f64,
    /// Component weights.
    pub weights: RiskWeights,
}

/// Rainfall provider and cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RainfallConfig {
    /// How long a cached reading stays valid.
    pub cache_ttl_secs: u64,
    /// Upper bound on a single provider call.
    pub provider_timeout_secs: u64,
    /// Current-weather endpoint.
    pub base_url: String,
    /// Provider API key. Empty disables live fetches.
    pub api_key: String,
}

impl RainfallConfig {
    /// Cache TTL as a [`Duration`].
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Provider timeout as a [`Duration`].
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// Periodic recomputation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between recomputation cycles.
    pub interval_secs: u64,
}

impl SchedulerConfig {
    /// Interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Persistent store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `DuckDB` file path, relative to the working directory.
    pub path: PathBuf,
}

impl Default for FloodMapConfig {
    /// The embedded defaults.
    ///
    /// # Panics
    ///
    /// Panics if the embedded `default.toml` is malformed, which the
    /// tests below rule out.
    fn default() -> Self {
        toml::de::from_str(DEFAULT_TOML)
            .unwrap_or_else(|e| panic!("Failed to parse embedded default config: {e}"))
    }
}

impl FloodMapConfig {
    /// Loads the defaults, overlays `path` if given, then environment
    /// overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, an
    /// environment value is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let overlay = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                log::info!("Loading config overrides from {}", path.display());
                Some(text)
            }
            None => None,
        };

        let mut config = Self::from_toml_overlay(overlay.as_deref())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the defaults with an optional TOML overlay, without
    /// touching the environment. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if either document is malformed or
    /// the merged document does not match the schema.
    pub fn from_toml_overlay(overlay: Option<&str>) -> Result<Self, ConfigError> {
        let mut merged: toml::Table = DEFAULT_TOML.parse()?;
        if let Some(overlay) = overlay {
            let overlay: toml::Table = overlay.parse()?;
            merge_tables(&mut merged, overlay);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Applies environment overrides using `lookup` to resolve variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENWEATHER_API_KEY") {
            self.rainfall.api_key = key;
        }
        if let Some(path) = lookup("FLOOD_MAP_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secs) = lookup("FLOOD_MAP_INTERVAL_SECS") {
            self.scheduler.interval_secs = parse_env_u64("FLOOD_MAP_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = lookup("FLOOD_MAP_CACHE_TTL_SECS") {
            self.rainfall.cache_ttl_secs = parse_env_u64("FLOOD_MAP_CACHE_TTL_SECS", &secs)?;
        }
        Ok(())
    }

    /// Checks every invariant the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hotspot = &self.hotspot;
        if hotspot.window_days == 0 {
            return Err(invalid("hotspot.window_days must be greater than 0"));
        }
        if !(hotspot.eps_distance.is_finite() && hotspot.eps_distance > 0.0) {
            return Err(invalid("hotspot.eps_distance must be a positive number"));
        }
        if hotspot.min_points == 0 {
            return Err(invalid("hotspot.min_points must be at least 1"));
        }
        if hotspot.min_distinct_days == 0 {
            return Err(invalid("hotspot.min_distinct_days must be at least 1"));
        }

        let risk = &self.risk;
        for (name, weight) in risk.weights.as_array() {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(invalid(&format!(
                    "risk.weights.{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        let sum = risk.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(invalid(&format!("risk.weights must sum to 1.0, got {sum}")));
        }
        if !(risk.rainfall_ceiling_mm.is_finite() && risk.rainfall_ceiling_mm > 0.0) {
            return Err(invalid("risk.rainfall_ceiling_mm must be positive"));
        }
        if risk.recurrence_window_days == 0 {
            return Err(invalid("risk.recurrence_window_days must be greater than 0"));
        }
        if !(risk.recurrence_saturation > 0.0 && risk.hotspot_saturation > 0.0) {
            return Err(invalid(
                "risk.recurrence_saturation and risk.hotspot_saturation must be positive",
            ));
        }

        if self.rainfall.cache_ttl_secs == 0 {
            return Err(invalid("rainfall.cache_ttl_secs must be greater than 0"));
        }
        if self.rainfall.provider_timeout_secs == 0 {
            return Err(invalid("rainfall.provider_timeout_secs must be greater than 0"));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(invalid("scheduler.interval_secs must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid {
        message: message.to_string(),
    }
}

fn parse_env_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| invalid(&format!("{name}={value:?} is not a valid integer: {e}")))
}

/// Recursively overlays `overlay` onto `base`. Nested tables merge,
/// everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn embedded_defaults_are_valid() {
        let config = FloodMapConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hotspot.min_points, 3);
        assert_eq!(config.hotspot.min_distinct_days, 3);
        assert_eq!(config.hotspot.window_days, 90);
        assert_eq!(config.rainfall.cache_ttl(), Duration::from_secs(1800));
        assert_eq!(config.scheduler.interval(), Duration::from_secs(30 * 60));
        assert_eq!(config.risk.weights, RiskWeights::default());
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((RiskWeights::default().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn overlay_replaces_only_given_keys() {
        let config = FloodMapConfig::from_toml_overlay(Some(
            "[hotspot]\nmin_points = 5\n\n[scheduler]\ninterval_secs = 60\n",
        ))
        .unwrap();
        assert_eq!(config.hotspot.min_points, 5);
        assert_eq!(config.hotspot.min_distinct_days, 3);
        assert!((config.hotspot.eps_distance - 0.002).abs() < 1e-12);
        assert_eq!(config.scheduler.interval_secs, 60);
        config.validate().unwrap();
    }

    #[test]
    fn weights_not_summing_to_one_are_rejected() {
        let config =
            FloodMapConfig::from_toml_overlay(Some("[risk.weights]\nrainfall = 0.5\n")).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn rebalanced_weights_are_accepted() {
        let config = FloodMapConfig::from_toml_overlay(Some(
            "[risk.weights]\nrainfall = 0.40\nrecurrence = 0.20\n",
        ))
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        for overlay in [
            "[hotspot]\nmin_points = 0\n",
            "[hotspot]\nmin_distinct_days = 0\n",
            "[hotspot]\nwindow_days = 0\n",
            "[hotspot]\neps_distance = 0.0\n",
            "[rainfall]\ncache_ttl_secs = 0\n",
            "[scheduler]\ninterval_secs = 0\n",
            "[risk]\nrainfall_ceiling_mm = -1.0\n",
        ] {
            let config = FloodMapConfig::from_toml_overlay(Some(overlay)).unwrap();
            assert!(config.validate().is_err(), "expected {overlay:?} to fail");
        }
    }

    #[test]
    fn negative_weight_is_rejected_even_if_sum_is_one() {
        let config = FloodMapConfig::from_toml_overlay(Some(
            "[risk.weights]\nrainfall = 0.55\ndrainage = -0.10\n",
        ))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_overlay_is_a_parse_error() {
        let err = FloodMapConfig::from_toml_overlay(Some("[hotspot\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err =
            FloodMapConfig::from_toml_overlay(Some("[hotspot]\nmin_points = \"three\"\n"))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: BTreeMap<&str, &str> = [
            ("OPENWEATHER_API_KEY", "secret"),
            ("FLOOD_MAP_DB_PATH", "/tmp/flood.duckdb"),
            ("FLOOD_MAP_INTERVAL_SECS", "120"),
        ]
        .into_iter()
        .collect();

        let mut config = FloodMapConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.rainfall.api_key, "secret");
        assert_eq!(config.database.path, PathBuf::from("/tmp/flood.duckdb"));
        assert_eq!(config.scheduler.interval_secs, 120);
        assert_eq!(config.rainfall.cache_ttl_secs, 1800);
    }

    #[test]
    fn malformed_env_number_is_invalid() {
        let mut config = FloodMapConfig::default();
        let err = config
            .apply_env_overrides(|key| {
                (key == "FLOOD_MAP_CACHE_TTL_SECS").then(|| "soon".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
