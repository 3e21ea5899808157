//! Anomaly detection: per-entity baselines, pluggable rules, risk scoring
//! and the alert log.

pub mod alert;
pub mod baseline;
pub mod engine;
pub mod event;
pub mod rules;
pub mod scoring;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::alert::{Alert, AlertLog};
pub use self::baseline::{Baseline, GeoPoint, Stat};
pub use self::engine::AnomalyDetector;
pub use self::event::EventData;
pub use self::rules::{Rule, RuleError, RuleRegistry};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid detector configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse impact tier of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Weight applied to a finding's confidence in the risk score.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 1.0,
        }
    }
}

/// What a rule reports. The engine stamps it with the rule name, entity and
/// time to form an [`Anomaly`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub confidence: f64,
    pub message: String,
}

impl Finding {
    pub fn new(
        kind: impl Into<String>,
        severity: Severity,
        confidence: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            severity,
            confidence,
            message: message.into(),
        }
    }
}

/// A triggered rule for one entity at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub rule: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    /// Always within [0, 1]; non-finite rule output is recorded as 0.
    pub confidence: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
}

impl Anomaly {
    pub fn from_finding(rule: &str, entity_id: &str, finding: Finding, at: DateTime<Utc>) -> Self {
        let confidence = if finding.confidence.is_finite() {
            finding.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            rule: rule.to_string(),
            kind: finding.kind,
            severity: finding.severity,
            confidence,
            message: finding.message,
            timestamp: at,
            entity_id: entity_id.to_string(),
        }
    }
}

/// A rule that failed instead of returning a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule: String,
    pub error: String,
}

/// Result of one `analyze` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub entity_id: String,
    pub anomalies: Vec<Anomaly>,
    /// Anomalies at or above the alert confidence threshold.
    pub alerts: Vec<Anomaly>,
    pub risk_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_errors: Vec<RuleFailure>,
}

impl AnalysisReport {
    pub fn has_rule(&self, rule: &str) -> bool {
        self.anomalies.iter().any(|a| a.rule == rule)
    }

    pub fn anomaly(&self, rule: &str) -> Option<&Anomaly> {
        self.anomalies.iter().find(|a| a.rule == rule)
    }
}
