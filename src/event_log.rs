//! Append-only CSV log of named experiment events and published results.

use crate::error::AnalysisError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: i64,
    pub message: String,
}

/// Shared handle to one event log file. Cloning shares the writer.
#[derive(Clone)]
pub struct EventLog {
    path: PathBuf,
    writer: Arc<Mutex<csv::Writer<File>>>,
}

impl EventLog {
    /// Open `path` for appending. The header is written only if the file is new.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let write_header = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` stamped with the current wall-clock time.
    pub fn log(&self, message: &str) -> Result<(), csv::Error> {
        self.log_at(chrono::Utc::now().timestamp_millis(), message)
    }

    pub fn log_at(&self, timestamp: i64, message: &str) -> Result<(), csv::Error> {
        let mut writer = self.writer.lock();
        writer.serialize(EventRecord {
            timestamp,
            message: message.to_string(),
        })?;
        writer.flush()?;
        Ok(())
    }
}

/// Read an event log in file order. Columns other than `timestamp` and
/// `message` are ignored.
pub fn read_event_log(path: &Path) -> Result<Vec<EventRecord>, AnalysisError> {
    if !path.exists() {
        return Err(AnalysisError::MissingLogFile(path.to_path_buf()));
    }
    let mut reader =
        csv::Reader::from_path(path).map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))?;
    reader
        .deserialize()
        .collect::<Result<Vec<EventRecord>, _>>()
        .map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))
}
