//! Per-entity behavioural baseline, maintained by exponential smoothing.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::event::EventData;

/// Mean radius of the Earth, km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Smoothed mean and standard deviation of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub mean: f64,
    pub stddev: f64,
}

impl Stat {
    pub const fn new(mean: f64, stddev: f64) -> Self {
        Self { mean, stddev }
    }

    /// Fold one observation in with smoothing factor `alpha`.
    ///
    /// `mean' = α·x + (1−α)·mean`; the variance uses the matching
    /// exponentially weighted form `var' = (1−α)·(var + α·(x−mean)²)`.
    pub fn update(&mut self, observed: f64, alpha: f64) {
        if !observed.is_finite() {
            return;
        }
        let diff = observed - self.mean;
        let variance = (1.0 - alpha) * (self.stddev * self.stddev + alpha * diff * diff);
        self.mean += alpha * diff;
        self.stddev = variance.sqrt();
    }

    /// |value − mean| / stddev, or `None` when the spread is degenerate.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.stddev <= f64::EPSILON || !value.is_finite() {
            return None;
        }
        Some((value - self.mean).abs() / self.stddev)
    }
}

/// A point on the globe, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in km (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// A location observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    pub point: GeoPoint,
    pub seen_at: DateTime<Utc>,
}

/// Running profile of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub request_count: Stat,
    pub response_time: Stat,
    pub access_hours: BTreeSet<u32>,
    pub geo_locations: VecDeque<GeoSample>,
    pub data_points: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            request_count: Stat::new(10.0, 2.0),
            response_time: Stat::new(100.0, 30.0),
            access_hours: BTreeSet::new(),
            geo_locations: VecDeque::new(),
            data_points: 0,
            last_seen: None,
        }
    }
}

impl Baseline {
    pub fn last_location(&self) -> Option<&GeoSample> {
        self.geo_locations.back()
    }

    /// Fold a resolved event into the profile. Called only after every rule
    /// has seen the pre-update baseline.
    pub fn observe(&mut self, event: &EventData, alpha: f64, max_geo_history: usize) {
        if let Some(count) = event.request_count {
            self.request_count.update(count, alpha);
        }
        if let Some(rt) = event.response_time {
            self.response_time.update(rt, alpha);
        }
        if let Some(hour) = event.access_hour.filter(|h| *h < 24) {
            self.access_hours.insert(hour);
        }
        if let (Some(point), Some(at)) = (event.current_location, event.timestamp) {
            if point.is_valid() {
                self.geo_locations.push_back(GeoSample { point, seen_at: at });
                while self.geo_locations.len() > max_geo_history.max(1) {
                    self.geo_locations.pop_front();
                }
            }
        }
        self.data_points += 1;
        if let Some(at) = event.timestamp {
            self.last_seen = Some(self.last_seen.map_or(at, |prev| prev.max(at)));
        }
    }
}
