//! Offline latency and resource analysis over repeated experiment iterations.
//!
//! For every iteration `i` in `1..=iterations` the analyzer reads
//! `<logs_root>/iteration<i>/<event_log_file>` and
//! `<logs_root>/iteration<i>/<resource_log_file>` and produces one
//! [`LatencySummaryRow`]. Missing or unreadable files degrade to blank fields.

use crate::error::AnalysisError;
use crate::event_log::{EventRecord, read_event_log};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub logs_root: PathBuf,
    pub iterations: u32,
    pub num_cores: usize,
    pub event_log_file: String,
    pub resource_log_file: String,
    pub registered_marker: String,
    pub summary_path: PathBuf,
}

impl AnalyzerConfig {
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        iteration_dir(&self.logs_root, iteration)
    }
}

/// `<logs_root>/iteration<N>`
pub fn iteration_dir(logs_root: &Path, iteration: u32) -> PathBuf {
    logs_root.join(format!("iteration{iteration}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummaryRow {
    pub iteration: u32,
    pub registered_ts: Option<i64>,
    pub first_result_ts: Option<i64>,
    pub latency_ms: Option<i64>,
    pub result_value: Option<String>,
    pub avg_cpu_percent: Option<f64>,
    pub avg_heap_used_mb: Option<f64>,
}

impl LatencySummaryRow {
    pub fn blank(iteration: u32) -> Self {
        Self {
            iteration,
            registered_ts: None,
            first_result_ts: None,
            latency_ms: None,
            result_value: None,
            avg_cpu_percent: None,
            avg_heap_used_mb: None,
        }
    }
}

/// On-disk layout of a summary row.
#[derive(Serialize)]
struct SummaryRecord {
    iteration: u32,
    registered_query_ts: Option<i64>,
    first_result_ts: Option<i64>,
    latency_ms: Option<i64>,
    result_value: Option<String>,
    avg_cpu_percent: Option<String>,
    #[serde(rename = "avg_heapUsedMB")]
    avg_heap_used_mb: Option<String>,
}

impl From<&LatencySummaryRow> for SummaryRecord {
    fn from(row: &LatencySummaryRow) -> Self {
        Self {
            iteration: row.iteration,
            registered_query_ts: row.registered_ts,
            first_result_ts: row.first_result_ts,
            latency_ms: row.latency_ms,
            result_value: row.result_value.clone(),
            avg_cpu_percent: row.avg_cpu_percent.map(|v| format!("{v:.2}")),
            avg_heap_used_mb: row.avg_heap_used_mb.map(|v| format!("{v:.2}")),
        }
    }
}

/// The columns of a resource-usage log the analysis needs.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResourceRow {
    pub timestamp: f64,
    pub cpu_user: f64,
    #[serde(rename = "heapUsedMB")]
    pub heap_used_mb: f64,
}

/// CPU percent between two consecutive samples, or `None` when the time
/// delta is not strictly positive.
pub fn cpu_percent(prev: &ResourceRow, curr: &ResourceRow, num_cores: usize) -> Option<f64> {
    let delta_time = curr.timestamp - prev.timestamp;
    if delta_time <= 0.0 {
        return None;
    }
    let delta_cpu_user = curr.cpu_user - prev.cpu_user;
    Some(delta_cpu_user / (delta_time * num_cores as f64) * 100.0)
}

/// Average CPU percent over valid consecutive pairs and average heap MB over
/// every sample but the first.
pub fn summarize_resources(rows: &[ResourceRow], num_cores: usize) -> (Option<f64>, Option<f64>) {
    let mut cpu = Vec::new();
    let mut heap = Vec::new();
    for pair in rows.windows(2) {
        if let Some(percent) = cpu_percent(&pair[0], &pair[1], num_cores) {
            cpu.push(percent);
        }
        heap.push(pair[1].heap_used_mb);
    }
    (mean(&cpu), mean(&heap))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyObservation {
    pub registered_ts: Option<i64>,
    pub first_result_ts: Option<i64>,
    pub result_value: Option<String>,
}

impl LatencyObservation {
    pub fn latency_ms(&self) -> Option<i64> {
        Some(self.first_result_ts? - self.registered_ts?)
    }
}

/// A result value: non-empty and a finite number.
fn is_numeric(message: &str) -> bool {
    let trimmed = message.trim();
    !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Find the first registration marker and the first numeric message after it.
pub fn extract_latency(records: &[EventRecord], registered_marker: &str) -> LatencyObservation {
    let mut observation = LatencyObservation::default();
    for record in records {
        match observation.registered_ts {
            None => {
                if record.message == registered_marker {
                    observation.registered_ts = Some(record.timestamp);
                }
            }
            Some(_) => {
                if is_numeric(&record.message) {
                    observation.first_result_ts = Some(record.timestamp);
                    observation.result_value = Some(record.message.clone());
                    break;
                }
            }
        }
    }
    observation
}

fn read_resource_rows(path: &Path) -> Result<Vec<ResourceRow>, AnalysisError> {
    if !path.exists() {
        return Err(AnalysisError::MissingLogFile(path.to_path_buf()));
    }
    let mut reader =
        csv::Reader::from_path(path).map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))?;
    reader
        .deserialize()
        .collect::<Result<Vec<ResourceRow>, _>>()
        .map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))
}

pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn analyze_iteration(&self, iteration: u32) -> LatencySummaryRow {
        let dir = self.config.iteration_dir(iteration);
        let mut row = LatencySummaryRow::blank(iteration);

        let resource_path = dir.join(&self.config.resource_log_file);
        match read_resource_rows(&resource_path) {
            Ok(rows) => {
                let (cpu, heap) = summarize_resources(&rows, self.config.num_cores);
                row.avg_cpu_percent = cpu;
                row.avg_heap_used_mb = heap;
            }
            Err(AnalysisError::MissingLogFile(path)) => {
                warn!(iteration, path = %path.display(), "missing resource log");
            }
            Err(e) => warn!(iteration, error = %e, "unreadable resource log"),
        }

        let event_path = dir.join(&self.config.event_log_file);
        let records = match read_event_log(&event_path) {
            Ok(records) => records,
            Err(AnalysisError::MissingLogFile(path)) => {
                warn!(iteration, path = %path.display(), "missing event log");
                return row;
            }
            Err(e) => {
                warn!(iteration, error = %e, "unreadable event log");
                return row;
            }
        };

        let observation = extract_latency(&records, &self.config.registered_marker);
        row.registered_ts = observation.registered_ts;
        if let Some(latency) = observation.latency_ms() {
            row.first_result_ts = observation.first_result_ts;
            row.latency_ms = Some(latency);
            row.result_value = observation.result_value;
        }
        row
    }

    pub fn analyze(&self) -> Vec<LatencySummaryRow> {
        (1..=self.config.iterations)
            .map(|i| self.analyze_iteration(i))
            .collect()
    }

    /// Analyze every iteration and write the summary file.
    pub fn run(&self) -> Result<Vec<LatencySummaryRow>, AnalysisError> {
        let rows = self.analyze();
        write_summary(&self.config.summary_path, &rows)?;
        info!(
            path = %self.config.summary_path.display(),
            iterations = rows.len(),
            "latency and resource usage summary written"
        );
        Ok(rows)
    }
}

pub fn write_summary(path: &Path, rows: &[LatencySummaryRow]) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| AnalysisError::Io(parent.to_path_buf(), e))?;
    }
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))?;
    for row in rows {
        writer
            .serialize(SummaryRecord::from(row))
            .map_err(|e| AnalysisError::Csv(path.to_path_buf(), e))?;
    }
    writer
        .flush()
        .map_err(|e| AnalysisError::Io(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(timestamp: f64, cpu_user: f64, heap: f64) -> ResourceRow {
        ResourceRow {
            timestamp,
            cpu_user,
            heap_used_mb: heap,
        }
    }

    fn event(timestamp: i64, message: &str) -> EventRecord {
        EventRecord {
            timestamp,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_cpu_percent_formula() {
        let value = cpu_percent(&row(1000.0, 50.0, 0.0), &row(1100.0, 90.0, 0.0), 8).unwrap();
        assert!((value - 40.0 / (100.0 * 8.0) * 100.0).abs() < 1e-9);
        assert!(cpu_percent(&row(1000.0, 50.0, 0.0), &row(1000.0, 90.0, 0.0), 8).is_none());
    }

    #[test]
    fn test_heap_average_skips_first_sample() {
        let rows = [row(0.0, 0.0, 100.0), row(100.0, 10.0, 20.0), row(100.0, 10.0, 40.0)];
        let (cpu, heap) = summarize_resources(&rows, 1);
        assert_eq!(heap, Some(30.0));
        // second pair has zero delta and yields no data point
        assert_eq!(cpu, Some(10.0));
    }

    #[test]
    fn test_first_result_after_registration() {
        let records = [
            event(50, "7.0"),
            event(100, "query registered"),
            event(100, "other"),
            event(250, "42.5"),
            event(300, "43.0"),
        ];
        let observation = extract_latency(&records, "query registered");
        assert_eq!(observation.registered_ts, Some(100));
        assert_eq!(observation.first_result_ts, Some(250));
        assert_eq!(observation.result_value.as_deref(), Some("42.5"));
        assert_eq!(observation.latency_ms(), Some(150));
    }

    #[test]
    fn test_numeric_detection() {
        assert!(is_numeric("-0.25"));
        assert!(is_numeric("1e3"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("NaN"));
        assert!(!is_numeric("approximation_query_registered"));
        assert!(!is_numeric("inf"));
        assert!(!is_numeric("-Infinity"));
    }

    #[test]
    fn test_infinite_message_is_not_a_result() {
        let records = [event(10, "query registered"), event(20, "inf"), event(30, "1.5")];
        let observation = extract_latency(&records, "query registered");
        assert_eq!(observation.first_result_ts, Some(30));
        assert_eq!(observation.result_value.as_deref(), Some("1.5"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_each_missing_log_is_warned_about() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = Analyzer::new(AnalyzerConfig {
            logs_root: dir.path().to_path_buf(),
            iterations: 1,
            num_cores: 1,
            event_log_file: "exact_log.csv".into(),
            resource_log_file: "exact_resource_usage.csv".into(),
            registered_marker: "exact_query_registered".into(),
            summary_path: dir.path().join("summary.csv"),
        });

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let row = tracing::subscriber::with_default(subscriber, || analyzer.analyze_iteration(1));

        assert_eq!(row, LatencySummaryRow::blank(1));
        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("missing resource log"));
        assert!(output.contains("missing event log"));
    }
}
