//! The monitoring core: record store plus anomaly detector behind one
//! handle, shared by the HTTP API, the CLI and the retention sweeper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::detect::rules::{Rule, RuleError};
use crate::detect::{Alert, AnalysisReport, AnomalyDetector, Baseline, DetectError, EventData, Finding};
use crate::scheduler::{self, PeriodicHandle};
use crate::storage::export::{ExportError, ExportFormat};
use crate::storage::record::{LogInput, LogLevel, LogRecord};
use crate::storage::search::{SearchQuery, SearchResult};
use crate::storage::{LogStore, StoreError, StoreStats, SweepReport};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid store configuration: {0}")]
    InvalidStoreConfig(&'static str),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    #[serde(flatten)]
    pub sweep: SweepReport,
    pub baselines_pruned: usize,
}

#[derive(Debug)]
pub struct Monitor {
    config: Config,
    store: LogStore,
    detector: AnomalyDetector,
}

impl Monitor {
    pub fn new(config: Config) -> Result<Self, MonitorError> {
        let store_config = &config.store;
        if store_config.max_logs == 0 {
            return Err(MonitorError::InvalidStoreConfig("max_logs must be greater than zero"));
        }
        if store_config.search_cache_size == 0 {
            return Err(MonitorError::InvalidStoreConfig(
                "search_cache_size must be greater than zero",
            ));
        }
        if store_config.sweep_interval_secs == 0 {
            return Err(MonitorError::InvalidStoreConfig(
                "sweep_interval_secs must be greater than zero",
            ));
        }
        let detector = AnomalyDetector::new(config.detect.clone())?;
        let store = LogStore::new(config.store.clone());
        Ok(Self {
            config,
            store,
            detector,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    // ----- Records

    pub fn add_log(&self, input: LogInput) -> LogRecord {
        self.store.add(input)
    }

    pub fn get_log(&self, id: &Uuid) -> Option<LogRecord> {
        self.store.get(id)
    }

    pub fn search(&self, query: &SearchQuery) -> SearchResult {
        self.store.search(query)
    }

    pub fn get_by_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.store.by_level(level)
    }

    pub fn get_by_service(&self, service: &str) -> Vec<LogRecord> {
        self.store.by_service(service)
    }

    pub fn get_by_user(&self, user_id: &str) -> Vec<LogRecord> {
        self.store.by_user(user_id)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn export_to_file(
        &self,
        filename: impl AsRef<Path>,
        format: ExportFormat,
        filters: &SearchQuery,
    ) -> Result<PathBuf, ExportError> {
        self.store.export_to_file(filename, format, filters)
    }

    // ----- Detection

    pub fn analyze(&self, entity_id: &str, event: &EventData) -> AnalysisReport {
        self.detector.analyze(entity_id, event)
    }

    pub fn add_rule<F>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(&EventData, &Baseline) -> Result<Option<Finding>, RuleError> + Send + Sync + 'static,
    {
        self.detector.add_rule(name, f)
    }

    pub fn register_rule(&self, name: impl Into<String>, rule: impl Rule + 'static) -> bool {
        self.detector.register_rule(name, rule)
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.detector.remove_rule(name)
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.detector.rule_names()
    }

    pub fn baseline(&self, entity_id: &str) -> Option<Baseline> {
        self.detector.baseline(entity_id)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.detector.recent_alerts(limit)
    }

    // ----- Retention

    /// Sweep expired records and, when configured, idle baselines.
    pub fn run_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, StoreError> {
        let sweep = self.store.sweep(now)?;
        let baselines_pruned = match self.config.detect.baseline_idle_days {
            Some(days) => {
                let cutoff = now
                    .checked_sub_signed(chrono::Duration::days(i64::from(days)))
                    .ok_or(StoreError::InvalidRetention { days })?;
                self.detector.prune_idle(cutoff)
            }
            None => 0,
        };
        Ok(RetentionReport {
            sweep,
            baselines_pruned,
        })
    }

    /// Start the periodic retention sweeper on the current runtime.
    pub fn start_retention(self: &Arc<Self>) -> PeriodicHandle {
        let period = Duration::from_secs(self.config.store.sweep_interval_secs);
        let monitor = Arc::clone(self);
        info!(
            interval_secs = period.as_secs(),
            retention_days = self.config.store.retention_days,
            "starting retention sweeper"
        );
        scheduler::spawn_periodic("retention", period, move || {
            monitor.run_retention(Utc::now())?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_retention_prunes_idle_baselines_when_enabled() {
        let mut config = Config::default();
        config.detect.baseline_idle_days = Some(30);
        let monitor = Monitor::new(config).unwrap();
        let now = Utc::now();

        monitor.add_log(LogInput::new(LogLevel::Info, "old").with_timestamp(now - ChronoDuration::days(8)));
        monitor.add_log(LogInput::new(LogLevel::Info, "new").with_timestamp(now));
        monitor.analyze("idle", &EventData::new().at(now - ChronoDuration::days(31)));
        monitor.analyze("active", &EventData::new().at(now));

        let report = monitor.run_retention(now).unwrap();
        assert_eq!(report.sweep.evicted, 1);
        assert_eq!(report.sweep.remaining, 1);
        assert_eq!(report.baselines_pruned, 1);
        assert!(monitor.baseline("idle").is_none());
    }

    #[test]
    fn test_retention_keeps_baselines_by_default() {
        let monitor = Monitor::new(Config::default()).unwrap();
        let now = Utc::now();
        monitor.analyze("idle", &EventData::new().at(now - ChronoDuration::days(400)));

        let report = monitor.run_retention(now).unwrap();
        assert_eq!(report.baselines_pruned, 0);
        assert!(monitor.baseline("idle").is_some());
    }

    #[test]
    fn test_zero_store_settings_are_rejected() {
        let mut config = Config::default();
        config.store.sweep_interval_secs = 0;
        let err = Monitor::new(config).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidStoreConfig(_)));
        assert!(err.to_string().contains("sweep_interval_secs"));

        let mut config = Config::default();
        config.store.max_logs = 0;
        assert!(matches!(Monitor::new(config), Err(MonitorError::InvalidStoreConfig(_))));

        let mut config = Config::default();
        config.detect.smoothing_alpha = 0.0;
        assert!(matches!(Monitor::new(config), Err(MonitorError::Detect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retention_sweeps_on_interval() {
        let mut config = Config::default();
        config.store.sweep_interval_secs = 60;
        let monitor = Arc::new(Monitor::new(config).unwrap());
        monitor.add_log(
            LogInput::new(LogLevel::Info, "stale").with_timestamp(Utc::now() - ChronoDuration::days(30)),
        );

        let handle = monitor.start_retention();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(monitor.store().is_empty());
        assert!(handle.runs() >= 1);
        handle.shutdown().await;
    }
}
