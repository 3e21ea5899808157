//! Anomaly rules and the ordered rule registry.
//!
//! A rule looks at one resolved event and the entity's pre-update baseline
//! and returns at most one [`Finding`]. Rules that cannot decide return
//! `Ok(None)`; rules that hit bad input return a [`RuleError`], which the
//! engine logs and reports without aborting the other rules.

use std::sync::Arc;

use thiserror::Error;

use crate::config::DetectConfig;
use crate::detect::baseline::Baseline;
use crate::detect::event::EventData;
use crate::detect::{Finding, Severity};

pub const BRUTE_FORCE: &str = "brute-force";
pub const VOLUME_ANOMALY: &str = "volume-anomaly";
pub const TIME_ANOMALY: &str = "time-anomaly";
pub const GEO_ANOMALY: &str = "geo-anomaly";
pub const STATISTICAL_ANOMALY: &str = "statistical-anomaly";

/// Failed-attempt count above which brute force is suspected.
const BRUTE_FORCE_ATTEMPTS: u32 = 5;
/// Request volume multiple of the average that counts as a spike.
const VOLUME_MULTIPLIER: f64 = 5.0;
/// Fastest plausible travel speed, km/h (commercial flight).
const MAX_TRAVEL_SPEED_KMH: f64 = 900.0;
/// Movement below this distance is treated as staying put.
const GEO_NOISE_KM: f64 = 1.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// A pluggable anomaly check.
pub trait Rule: Send + Sync {
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError>;
}

impl<F> Rule for F
where
    F: Fn(&EventData, &Baseline) -> Result<Option<Finding>, RuleError> + Send + Sync,
{
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        self(event, baseline)
    }
}

/// Pin a closure to the rule signature so its argument and return types
/// are inferred.
pub fn rule_fn<F>(f: F) -> F
where
    F: Fn(&EventData, &Baseline) -> Result<Option<Finding>, RuleError> + Send + Sync + 'static,
{
    f
}

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

/// Too many failed attempts in one observation.
pub struct BruteForceRule;

impl Rule for BruteForceRule {
    fn evaluate(&self, event: &EventData, _baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        let Some(attempts) = event.failed_attempts.filter(|n| *n > BRUTE_FORCE_ATTEMPTS) else {
            return Ok(None);
        };
        Ok(Some(Finding::new(
            "authentication",
            Severity::High,
            (f64::from(attempts) / 10.0).min(1.0),
            format!("{attempts} failed attempts"),
        )))
    }
}

/// Request volume far above the entity's average.
pub struct VolumeRule;

impl Rule for VolumeRule {
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        let Some(count) = event.request_count else {
            return Ok(None);
        };
        if !count.is_finite() || count < 0.0 {
            return Err(RuleError::InvalidInput {
                field: "requestCount",
                reason: format!("{count} is not a valid request count"),
            });
        }
        let avg = event
            .avg_request_count
            .unwrap_or(baseline.request_count.mean);
        if !avg.is_finite() {
            return Err(RuleError::InvalidInput {
                field: "avgRequestCount",
                reason: format!("{avg} is not a valid average"),
            });
        }
        if avg <= 0.0 || count <= avg * VOLUME_MULTIPLIER {
            return Ok(None);
        }
        let ratio = count / avg;
        Ok(Some(Finding::new(
            "volume",
            Severity::Medium,
            (ratio / (VOLUME_MULTIPLIER * 2.0)).min(1.0),
            format!("{count:.0} requests is {ratio:.1}x the average of {avg:.1}"),
        )))
    }
}

/// Access at an hour the entity does not normally use.
pub struct TimeOfDayRule;

impl Rule for TimeOfDayRule {
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        let Some(hour) = event.access_hour else {
            return Ok(None);
        };
        if hour > 23 {
            return Err(RuleError::InvalidInput {
                field: "accessHour",
                reason: format!("{hour} is not an hour of day"),
            });
        }
        let is_new = event.is_new_user.unwrap_or(baseline.data_points == 0);
        if is_new {
            return Ok(None);
        }
        let usual = match &event.usual_access_hours {
            Some(hours) => hours.contains(&hour),
            None if baseline.access_hours.is_empty() => return Ok(None),
            None => baseline.access_hours.contains(&hour),
        };
        if usual {
            return Ok(None);
        }
        Ok(Some(Finding::new(
            "temporal",
            Severity::Low,
            0.6,
            format!("access at unusual hour {hour:02}:00"),
        )))
    }
}

/// Impossible travel between the previous and the current location.
pub struct GeoVelocityRule {
    /// Beyond this age the baseline's last location is not compared.
    pub window_ms: u64,
}

impl Rule for GeoVelocityRule {
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        let Some(current) = event.current_location else {
            return Ok(None);
        };
        let (previous, elapsed_ms) = match (event.last_known_location, event.time_since_last_access) {
            (Some(prev), Some(ms)) => (prev, ms),
            (prev, ms) => {
                let Some(sample) = baseline.last_location() else {
                    return Ok(None);
                };
                let derived = event
                    .timestamp
                    .map(|ts| (ts - sample.seen_at).num_milliseconds().max(0) as u64);
                let Some(elapsed) = ms.or(derived) else {
                    return Ok(None);
                };
                if ms.is_none() && elapsed > self.window_ms {
                    return Ok(None);
                }
                (prev.unwrap_or(sample.point), elapsed)
            }
        };

        for (field, point) in [("lastKnownLocation", previous), ("currentLocation", current)] {
            if !point.is_valid() {
                return Err(RuleError::InvalidInput {
                    field,
                    reason: format!("({}, {}) is not a coordinate", point.lat, point.lon),
                });
            }
        }

        let distance = previous.distance_km(&current);
        if distance < GEO_NOISE_KM {
            return Ok(None);
        }
        let hours = elapsed_ms as f64 / MS_PER_HOUR;
        let speed = if hours > 0.0 { distance / hours } else { f64::INFINITY };
        if speed <= MAX_TRAVEL_SPEED_KMH {
            return Ok(None);
        }
        Ok(Some(Finding::new(
            "impossible-travel",
            Severity::High,
            0.95,
            format!("moved {distance:.0} km in {:.1} min ({speed:.0} km/h)", hours * 60.0),
        )))
    }
}

/// Request count or response time far outside the smoothed baseline.
pub struct StatisticalRule {
    pub threshold: f64,
    /// Baseline observations required before the rule may fire.
    pub min_data_points: u64,
}

impl Rule for StatisticalRule {
    fn evaluate(&self, event: &EventData, baseline: &Baseline) -> Result<Option<Finding>, RuleError> {
        if baseline.data_points < self.min_data_points {
            return Ok(None);
        }
        let candidates = [
            ("requestCount", event.request_count, &baseline.request_count),
            ("responseTime", event.response_time, &baseline.response_time),
        ];
        let worst = candidates
            .iter()
            .filter_map(|(name, value, stat)| {
                let value = (*value)?;
                stat.z_score(value).map(|z| (*name, value, stat.mean, z))
            })
            .filter(|(_, _, _, z)| *z > self.threshold)
            .max_by(|a, b| a.3.total_cmp(&b.3));

        Ok(worst.map(|(metric, value, mean, z)| {
            Finding::new(
                "statistical",
                Severity::Medium,
                (z / (self.threshold * 2.0)).min(1.0),
                format!("{metric} {value:.1} deviates from baseline {mean:.1} (z-score {z:.1})"),
            )
        }))
    }
}

// ---------------------------------------------------------------------------
// RuleRegistry
// ---------------------------------------------------------------------------

/// Named rules in registration order.
///
/// Registering an existing name replaces that rule in place, keeping its
/// position; there is no versioning.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<(String, Arc<dyn Rule>)>,
}

impl RuleRegistry {
    /// The five built-in rules, parameterised from `config`.
    pub fn builtin(config: &DetectConfig) -> Self {
        let mut registry = Self::default();
        registry.register(BRUTE_FORCE, BruteForceRule);
        registry.register(VOLUME_ANOMALY, VolumeRule);
        registry.register(TIME_ANOMALY, TimeOfDayRule);
        registry.register(
            GEO_ANOMALY,
            GeoVelocityRule {
                window_ms: config.window_size_ms,
            },
        );
        registry.register(
            STATISTICAL_ANOMALY,
            StatisticalRule {
                threshold: config.std_dev_threshold,
                min_data_points: config.min_data_points,
            },
        );
        registry
    }

    /// Add or replace a rule. Returns `true` when a rule was replaced.
    pub fn register(&mut self, name: impl Into<String>, rule: impl Rule + 'static) -> bool {
        let name = name.into();
        let rule: Arc<dyn Rule> = Arc::new(rule);
        match self.rules.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => {
                slot.1 = rule;
                true
            }
            None => {
                self.rules.push((name, rule));
                false
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(n, _)| n != name);
        self.rules.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Rule>)> {
        self.rules.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.names())
            .finish()
    }
}
