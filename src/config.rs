//! TOML configuration for logwarden.
//!
//! A layered model with sensible defaults: an explicit path, the
//! `LOGWARDEN_CONFIG` environment variable, a standard system location, and
//! finally the compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "LOGWARDEN_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/logwarden/logwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the monitor process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded logwarden configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit`, when given. A failure here is an error.
    /// 2. The path named by `LOGWARDEN_CONFIG`.
    /// 3. `/etc/logwarden/logwarden.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Steps 2-4 of [`Config::resolve`]; never fails.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOGWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the monitor cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.store.max_logs == 0 {
            anyhow::bail!("store.max_logs must be greater than zero");
        }
        if self.store.search_cache_size == 0 {
            anyhow::bail!("store.search_cache_size must be greater than zero");
        }
        if self.store.sweep_interval_secs == 0 {
            anyhow::bail!("store.sweep_interval_secs must be greater than zero");
        }
        let d = &self.detect;
        if !(d.smoothing_alpha > 0.0 && d.smoothing_alpha <= 1.0) {
            anyhow::bail!("detect.smoothing_alpha must be in (0, 1], got {}", d.smoothing_alpha);
        }
        if !(0.0..=1.0).contains(&d.alert_threshold) {
            anyhow::bail!("detect.alert_threshold must be in [0, 1], got {}", d.alert_threshold);
        }
        if d.std_dev_threshold <= 0.0 {
            anyhow::bail!("detect.std_dev_threshold must be positive, got {}", d.std_dev_threshold);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Record store, search cache and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Hard cap on stored records; the oldest record is evicted beyond it.
    pub max_logs: usize,
    /// Records older than this many days are removed by the retention sweep.
    pub retention_days: u32,
    /// Seconds between retention sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum number of cached search results.
    pub search_cache_size: usize,
    /// Directory relative export file names are resolved against.
    pub export_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_logs: 100_000,
            retention_days: 7,
            sweep_interval_secs: 3600,
            search_cache_size: 1000,
            export_dir: PathBuf::from("exports"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detect
// ---------------------------------------------------------------------------

/// Anomaly detection and baseline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    /// Observations a baseline needs before the statistical rule may fire.
    pub min_data_points: u64,
    /// Z-score above which the statistical rule fires.
    pub std_dev_threshold: f64,
    /// Lookback (ms) within which the last-seen location is still comparable.
    pub window_size_ms: u64,
    /// Minimum per-anomaly confidence for an alert.
    pub alert_threshold: f64,
    /// Exponential smoothing factor for baseline updates.
    pub smoothing_alpha: f64,
    /// Locations kept per baseline.
    pub max_geo_history: usize,
    /// Alerts kept in the in-memory alert log.
    pub max_alert_history: usize,
    /// Drop baselines not updated for this many days. Disabled when unset.
    pub baseline_idle_days: Option<u32>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            min_data_points: 100,
            std_dev_threshold: 3.0,
            window_size_ms: 3_600_000,
            alert_threshold: 0.8,
            smoothing_alpha: 0.1,
            max_geo_history: 10,
            max_alert_history: 1000,
            baseline_idle_days: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Process logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.store.max_logs, 100_000);
        assert_eq!(cfg.store.retention_days, 7);
        assert_eq!(cfg.store.search_cache_size, 1000);
        assert_eq!(cfg.detect.min_data_points, 100);
        assert_eq!(cfg.detect.std_dev_threshold, 3.0);
        assert_eq!(cfg.detect.window_size_ms, 3_600_000);
        assert_eq!(cfg.detect.alert_threshold, 0.8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[store]\nmax_logs = 50\n\n[detect]\nalert_threshold = 0.5\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.store.max_logs, 50);
        assert_eq!(cfg.store.retention_days, 7);
        assert_eq!(cfg.detect.alert_threshold, 0.5);
        assert_eq!(cfg.detect.std_dev_threshold, 3.0);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut cfg = Config::default();
        cfg.store.max_logs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detect.smoothing_alpha = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detect.alert_threshold = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
