//! Log record types: the ingest shape and the immutable stored record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Width of a time-index bucket, in seconds.
pub const TIME_BUCKET_SECS: i64 = 60;

/// Severity level of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "DEBUG")]
    Debug,
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "warning", alias = "WARN", alias = "WARNING")]
    Warn,
    #[serde(alias = "ERROR")]
    Error,
    #[serde(alias = "FATAL")]
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// Levels counted towards the error rate.
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// Request-scoped measurements attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Handling time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Caller-supplied record. Every field is optional; missing ones are
/// defaulted on ingest rather than rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogInput {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<LogLevel>,
    pub service: Option<String>,
    pub message: String,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub data: serde_json::Value,
    pub context: serde_json::Value,
    pub metadata: Metadata,
}

impl LogInput {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level: Some(level),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.metadata.status_code = Some(status_code);
        self
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.metadata.duration = Some(duration_ms);
        self
    }
}

/// A stored, enriched record. Never mutated after ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LogRecord {
    /// Enrich an input: fresh id, timestamp defaulting to `now`, level
    /// defaulting to `info`, and empty objects for `data`/`context`.
    pub fn from_input(input: LogInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: input.timestamp.unwrap_or(now),
            level: input.level.unwrap_or(LogLevel::Info),
            service: input.service.filter(|s| !s.is_empty()),
            message: input.message,
            user_id: input.user_id.filter(|s| !s.is_empty()),
            request_id: input.request_id.filter(|s| !s.is_empty()),
            data: object_or_empty(input.data),
            context: object_or_empty(input.context),
            metadata: input.metadata,
        }
    }

    /// Minute bucket used by the time index.
    pub fn time_bucket(&self) -> i64 {
        time_bucket(&self.timestamp)
    }
}

pub fn time_bucket(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(TIME_BUCKET_SECS)
}

fn object_or_empty(value: serde_json::Value) -> serde_json::Value {
    if value.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        value
    }
}
