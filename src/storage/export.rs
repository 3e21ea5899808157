//! Caller-triggered export of matching records to JSON or CSV.
//!
//! This is the only place the store touches the filesystem. It is a
//! synchronous, blocking call and errors go straight back to the caller.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::storage::record::LogRecord;
use crate::storage::search::SearchQuery;
use crate::storage::LogStore;

/// Fixed CSV column order.
pub const CSV_HEADER: [&str; 6] = ["timestamp", "level", "service", "message", "userId", "statusCode"];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode JSON export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode CSV export: {0}")]
    Csv(#[from] csv::Error),

    #[error("unknown export format '{0}' (expected json or csv)")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl LogStore {
    /// Write every record matching `filters` (paging ignored) to `filename`.
    ///
    /// Relative names resolve against the configured export directory, which
    /// is created on demand. Returns the path written.
    pub fn export_to_file(
        &self,
        filename: impl AsRef<Path>,
        format: ExportFormat,
        filters: &SearchQuery,
    ) -> Result<PathBuf, ExportError> {
        let filename = filename.as_ref();
        let path = if filename.is_absolute() {
            filename.to_path_buf()
        } else {
            self.config().export_dir.join(filename)
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ExportError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let records = self.matching(filters);
        match format {
            ExportFormat::Json => write_json(&path, &records)?,
            ExportFormat::Csv => write_csv(&path, &records)?,
        }

        info!(path = %path.display(), %format, records = records.len(), "exported records");
        Ok(path)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json(path: &Path, records: &[LogRecord]) -> Result<(), ExportError> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush().map_err(io_err(path))?;
    Ok(())
}

fn write_csv(path: &Path, records: &[LogRecord]) -> Result<(), ExportError> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    writer.write_record(CSV_HEADER)?;
    for rec in records {
        let status = rec
            .metadata
            .status_code
            .map(|s| s.to_string())
            .unwrap_or_default();
        writer.write_record([
            rec.timestamp.to_rfc3339().as_str(),
            rec.level.as_str(),
            rec.service.as_deref().unwrap_or(""),
            rec.message.as_str(),
            rec.user_id.as_deref().unwrap_or(""),
            status.as_str(),
        ])?;
    }
    writer.flush().map_err(io_err(path))?;
    Ok(())
}
