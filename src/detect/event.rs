//! Behavioural observation passed to `analyze`.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::baseline::GeoPoint;

/// One observation about an entity. Every field is optional; rules that
/// need a missing field simply do not fire. Unrecognised fields are kept in
/// `extra` for custom rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventData {
    pub timestamp: Option<DateTime<Utc>>,
    pub failed_attempts: Option<u32>,
    pub request_count: Option<f64>,
    pub avg_request_count: Option<f64>,
    /// Milliseconds.
    pub response_time: Option<f64>,
    /// Hour of day, 0-23. Derived from `timestamp` when absent.
    pub access_hour: Option<u32>,
    pub usual_access_hours: Option<Vec<u32>>,
    pub is_new_user: Option<bool>,
    pub last_known_location: Option<GeoPoint>,
    pub current_location: Option<GeoPoint>,
    /// Milliseconds since the previous access.
    pub time_since_last_access: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `timestamp` and `access_hour` so rules see a complete event.
    pub fn resolved(&self, now: DateTime<Utc>) -> Self {
        let mut event = self.clone();
        let ts = *event.timestamp.get_or_insert(now);
        if event.access_hour.is_none() {
            event.access_hour = Some(ts.hour());
        }
        event
    }

    pub fn failed_attempts(mut self, n: u32) -> Self {
        self.failed_attempts = Some(n);
        self
    }

    pub fn requests(mut self, count: f64) -> Self {
        self.request_count = Some(count);
        self
    }

    pub fn avg_requests(mut self, avg: f64) -> Self {
        self.avg_request_count = Some(avg);
        self
    }

    pub fn response_time(mut self, ms: f64) -> Self {
        self.response_time = Some(ms);
        self
    }

    pub fn at_hour(mut self, hour: u32) -> Self {
        self.access_hour = Some(hour);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn new_user(mut self, is_new: bool) -> Self {
        self.is_new_user = Some(is_new);
        self
    }

    pub fn usual_hours(mut self, hours: impl IntoIterator<Item = u32>) -> Self {
        self.usual_access_hours = Some(hours.into_iter().collect());
        self
    }

    pub fn moved(mut self, from: GeoPoint, to: GeoPoint, elapsed_ms: u64) -> Self {
        self.last_known_location = Some(from);
        self.current_location = Some(to);
        self.time_since_last_access = Some(elapsed_ms);
        self
    }

    pub fn located(mut self, at: GeoPoint) -> Self {
        self.current_location = Some(at);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
