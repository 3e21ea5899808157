use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::DetectConfig;
use crate::detect::alert::{Alert, AlertLog};
use crate::detect::baseline::Baseline;
use crate::detect::event::EventData;
use crate::detect::rules::{Rule, RuleError, RuleRegistry};
use crate::detect::scoring::{risk_score, select_alerts};
use crate::detect::{AnalysisReport, Anomaly, DetectError, Finding, RuleFailure};

/// Evaluates rules against per-entity baselines and keeps the alert log.
///
/// Each entity's baseline sits behind its own mutex, held for the whole
/// read-evaluate-update sequence of one `analyze` call. Calls for the same
/// entity are therefore serialized; calls for different entities are not.
pub struct AnomalyDetector {
    config: DetectConfig,
    rules: RwLock<RuleRegistry>,
    baselines: RwLock<HashMap<String, Arc<Mutex<Baseline>>>>,
    alerts: Mutex<AlertLog>,
}

impl AnomalyDetector {
    pub fn new(config: DetectConfig) -> Result<Self, DetectError> {
        if !(config.smoothing_alpha > 0.0 && config.smoothing_alpha <= 1.0) {
            return Err(DetectError::InvalidConfig(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                config.smoothing_alpha
            )));
        }
        if !(0.0..=1.0).contains(&config.alert_threshold) {
            return Err(DetectError::InvalidConfig(format!(
                "alert_threshold must be in [0, 1], got {}",
                config.alert_threshold
            )));
        }
        if config.std_dev_threshold.is_nan() || config.std_dev_threshold <= 0.0 {
            return Err(DetectError::InvalidConfig(format!(
                "std_dev_threshold must be positive, got {}",
                config.std_dev_threshold
            )));
        }

        let rules = RuleRegistry::builtin(&config);
        let alerts = AlertLog::new(config.max_alert_history);
        Ok(Self {
            config,
            rules: RwLock::new(rules),
            baselines: RwLock::new(HashMap::new()),
            alerts: Mutex::new(alerts),
        })
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Evaluate every registered rule for `entity_id` against its current
    /// baseline, then fold the event into that baseline.
    ///
    /// Rule errors and panics are logged and reported in
    /// [`AnalysisReport::rule_errors`]; they never abort the call.
    pub fn analyze(&self, entity_id: &str, event: &EventData) -> AnalysisReport {
        let now = Utc::now();
        let event = event.resolved(now);
        // Snapshot so registrations during evaluation don't block on us.
        let rules = self.rules.read().clone();
        let slot = self.baseline_slot(entity_id);

        let mut baseline = slot.lock();
        let mut anomalies = Vec::new();
        let mut rule_errors = Vec::new();

        for (name, rule) in rules.iter() {
            match run_rule(rule.as_ref(), &event, &baseline) {
                Ok(Some(finding)) => {
                    debug!(rule = name, entity = entity_id, kind = %finding.kind, "rule triggered");
                    anomalies.push(Anomaly::from_finding(name, entity_id, finding, now));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(rule = name, entity = entity_id, %error, "rule evaluation failed");
                    rule_errors.push(RuleFailure {
                        rule: name.to_string(),
                        error,
                    });
                }
            }
        }

        baseline.observe(
            &event,
            self.config.smoothing_alpha,
            self.config.max_geo_history,
        );
        drop(baseline);

        let risk = risk_score(&anomalies);
        let alerts = select_alerts(&anomalies, self.config.alert_threshold);
        if !alerts.is_empty() {
            let mut log = self.alerts.lock();
            for alert in &alerts {
                warn!(
                    rule = %alert.rule,
                    entity = %alert.entity_id,
                    severity = ?alert.severity,
                    confidence = alert.confidence,
                    "{}",
                    alert.message
                );
                log.record(alert.clone());
            }
        }

        AnalysisReport {
            entity_id: entity_id.to_string(),
            anomalies,
            alerts,
            risk_score: risk,
            rule_errors,
        }
    }

    /// Register a closure as a rule. An existing rule with the same name is
    /// replaced in place.
    pub fn add_rule<F>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(&EventData, &Baseline) -> Result<Option<Finding>, RuleError> + Send + Sync + 'static,
    {
        self.register_rule(name, f)
    }

    pub fn register_rule(&self, name: impl Into<String>, rule: impl Rule + 'static) -> bool {
        let name = name.into();
        let replaced = self.rules.write().register(name.clone(), rule);
        if replaced {
            info!(rule = %name, "replaced anomaly rule");
        } else {
            info!(rule = %name, "registered anomaly rule");
        }
        replaced
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.write().remove(name)
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().names()
    }

    /// Snapshot of an entity's baseline, if one exists.
    pub fn baseline(&self, entity_id: &str) -> Option<Baseline> {
        let slot = self.baselines.read().get(entity_id).cloned()?;
        let snapshot = slot.lock().clone();
        Some(snapshot)
    }

    pub fn baseline_count(&self) -> usize {
        self.baselines.read().len()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().list_recent(limit)
    }

    pub fn total_alerts(&self) -> u64 {
        self.alerts.lock().total_raised()
    }

    /// Drop baselines whose last observation is older than `cutoff`.
    /// Baselines that never saw a timestamp are kept, as are baselines an
    /// `analyze` call currently holds.
    pub fn prune_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let mut baselines = self.baselines.write();
        let before = baselines.len();
        baselines.retain(|_, slot| {
            // Slots are only cloned under the map lock, so this count is stable.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.lock().last_seen {
                Some(seen) => seen >= cutoff,
                None => true,
            }
        });
        let pruned = before - baselines.len();
        if pruned > 0 {
            info!(pruned, remaining = baselines.len(), "pruned idle baselines");
        }
        pruned
    }

    fn baseline_slot(&self, entity_id: &str) -> Arc<Mutex<Baseline>> {
        if let Some(slot) = self.baselines.read().get(entity_id) {
            return Arc::clone(slot);
        }
        let mut baselines = self.baselines.write();
        let slot = baselines.entry(entity_id.to_string()).or_insert_with(|| {
            debug!(entity = entity_id, "created baseline");
            Arc::new(Mutex::new(Baseline::default()))
        });
        Arc::clone(slot)
    }
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("config", &self.config)
            .field("rules", &self.rule_names())
            .field("baselines", &self.baseline_count())
            .finish()
    }
}

/// Run one rule, turning both errors and panics into a message.
fn run_rule(rule: &dyn Rule, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(event, baseline))) {
        Ok(Ok(finding)) => Ok(finding),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("rule panicked: {msg}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::baseline::GeoPoint;
    use crate::detect::rules::{self, rule_fn};
    use crate::detect::Severity;
    use chrono::Duration;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(DetectConfig::default()).unwrap()
    }

    #[test]
    fn test_brute_force_scenario() {
        let d = detector();
        let report = d.analyze("u1", &EventData::new().failed_attempts(6));
        let a = report.anomaly(rules::BRUTE_FORCE).unwrap();
        assert_eq!(a.severity, Severity::High);
        assert!(a.confidence >= 0.6);
        assert_eq!(a.entity_id, "u1");
        assert!(report.risk_score > 0.0);
        // 0.6 is below the default alert threshold.
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn test_volume_scenario() {
        let d = detector();
        let report = d.analyze("u1", &EventData::new().requests(100.0).avg_requests(10.0));
        assert!(report.has_rule(rules::VOLUME_ANOMALY));
    }

    #[test]
    fn test_custom_rule_scenario() {
        let d = detector();
        let replaced = d.add_rule("always-flag", |_: &EventData, _: &Baseline| {
            Ok(Some(Finding::new("custom", Severity::Low, 0.3, "flagged")))
        });
        assert!(!replaced);

        let report = d.analyze("anyone", &EventData::new());
        let a = report.anomaly("always-flag").unwrap();
        assert_eq!(a.kind, "custom");
        assert_eq!(d.rule_names().last().map(String::as_str), Some("always-flag"));
    }

    #[test]
    fn test_geo_scenario_raises_alert() {
        let d = detector();
        let a = GeoPoint::new(40.0, -3.7);
        let b = GeoPoint::new(44.5, -3.7);
        let report = d.analyze("u1", &EventData::new().moved(a, b, 600_000));

        let anomaly = report.anomaly(rules::GEO_ANOMALY).unwrap();
        assert_eq!(anomaly.severity, Severity::High);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(d.recent_alerts(10)[0].anomaly.rule, rules::GEO_ANOMALY);
        assert_eq!(d.total_alerts(), 1);
    }

    #[test]
    fn test_failing_rules_are_isolated() {
        let d = detector();
        d.add_rule("broken", |_: &EventData, _: &Baseline| {
            Err(RuleError::Failed("backend unavailable".to_string()))
        });
        d.add_rule("panicky", |_: &EventData, _: &Baseline| -> Result<Option<Finding>, RuleError> {
            panic!("boom")
        });
        d.add_rule("after", rule_fn(|_, _| {
            Ok(Some(Finding::new("custom", Severity::Low, 0.1, "still ran")))
        }));

        let report = d.analyze("u1", &EventData::new().failed_attempts(9));
        assert!(report.has_rule(rules::BRUTE_FORCE));
        assert!(report.has_rule("after"));

        let failed: Vec<&str> = report.rule_errors.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(failed, vec!["broken", "panicky"]);
        assert!(report.rule_errors[1].error.contains("boom"));

        // The baseline is still updated.
        assert_eq!(d.baseline("u1").unwrap().data_points, 1);
    }

    #[test]
    fn test_event_does_not_see_its_own_update() {
        let d = detector();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        d.add_rule("recorder", move |_: &EventData, b: &Baseline| {
            recorder.lock().push(b.data_points);
            Ok(None)
        });

        d.analyze("u1", &EventData::new().requests(20.0));
        d.analyze("u1", &EventData::new().requests(20.0));
        assert_eq!(*seen.lock(), vec![0, 1]);

        let b = d.baseline("u1").unwrap();
        assert_eq!(b.data_points, 2);
        assert!(b.request_count.mean > 10.0);
    }

    #[test]
    fn test_baselines_are_per_entity() {
        let d = detector();
        d.analyze("a", &EventData::new());
        d.analyze("a", &EventData::new());
        d.analyze("b", &EventData::new());
        assert_eq!(d.baseline("a").unwrap().data_points, 2);
        assert_eq!(d.baseline("b").unwrap().data_points, 1);
        assert!(d.baseline("c").is_none());
        assert_eq!(d.baseline_count(), 2);
    }

    #[test]
    fn test_prune_idle_baselines() {
        let d = detector();
        let now = Utc::now();
        d.analyze("old", &EventData::new().at(now - Duration::days(40)));
        d.analyze("fresh", &EventData::new().at(now));

        assert_eq!(d.prune_idle(now - Duration::days(30)), 1);
        assert!(d.baseline("old").is_none());
        assert!(d.baseline("fresh").is_some());
    }

    #[test]
    fn test_prune_skips_baseline_held_by_analysis() {
        let d = detector();
        let now = Utc::now();
        d.analyze("busy", &EventData::new().at(now - Duration::days(40)));

        // An analysis that has fetched its slot but not yet locked it.
        let held = d.baseline_slot("busy");
        assert_eq!(d.prune_idle(now - Duration::days(30)), 0);
        held.lock().observe(&EventData::new().at(now), d.config().smoothing_alpha, 10);
        drop(held);

        assert_eq!(d.baseline("busy").unwrap().data_points, 2);
        assert_eq!(d.prune_idle(now - Duration::days(30)), 0);
    }

    #[test]
    fn test_remove_builtin_rule() {
        let d = detector();
        assert!(d.remove_rule(rules::BRUTE_FORCE));
        let report = d.analyze("u1", &EventData::new().failed_attempts(9));
        assert!(!report.has_rule(rules::BRUTE_FORCE));
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = DetectConfig {
            smoothing_alpha: 0.0,
            ..DetectConfig::default()
        };
        assert!(matches!(
            AnomalyDetector::new(config),
            Err(DetectError::InvalidConfig(_))
        ));
    }
}
