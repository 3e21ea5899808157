use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::Anomaly;

/// A raised alert, as kept in the alert log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub anomaly: Anomaly,
}

/// Bounded in-memory history of raised alerts, oldest dropped first.
#[derive(Debug)]
pub struct AlertLog {
    entries: VecDeque<Alert>,
    capacity: usize,
    total_raised: u64,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            total_raised: 0,
        }
    }

    pub fn record(&mut self, anomaly: Anomaly) -> Uuid {
        let id = Uuid::new_v4();
        self.total_raised += 1;
        if self.capacity == 0 {
            return id;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Alert {
            id,
            raised_at: Utc::now(),
            anomaly,
        });
        id
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Vec<Alert> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn total_raised(&self) -> u64 {
        self.total_raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Finding, Severity};

    fn anomaly(msg: &str) -> Anomaly {
        Anomaly::from_finding("r", "e", Finding::new("t", Severity::High, 0.9, msg), Utc::now())
    }

    #[test]
    fn test_bounded_and_newest_first() {
        let mut log = AlertLog::new(2);
        log.record(anomaly("a"));
        log.record(anomaly("b"));
        log.record(anomaly("c"));

        let recent = log.list_recent(10);
        let messages: Vec<&str> = recent.iter().map(|a| a.anomaly.message.as_str()).collect();
        assert_eq!(messages, vec!["c", "b"]);
        assert_eq!(log.total_raised(), 3);
        assert_eq!(log.list_recent(1).len(), 1);
    }
}
