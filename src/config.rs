//! TOML configuration for experiment runs and offline analysis.
//!
//! ```toml
//! [experiment]
//! iterations = 30
//! logs_root = "logs"
//!
//! [monitor]
//! interval_ms = 100
//!
//! [output]
//! broker_url = "mqtt://localhost:1883/"
//! topic = "output"
//! policy = "drop_when_full"
//!
//! [decomposition]
//! range_ms = 60000
//! step_ms = 60000
//! ```
//!
//! Every section and field is optional. Without a `[decomposition]` table
//! sub-queries use 60000 ms windows; inside the table an omitted field keeps
//! the combined query's own range or step.

use crate::analyzer::{AnalyzerConfig, iteration_dir};
use crate::approach::{ApproachKind, DEFAULT_COMBINED_QUERY};
use crate::error::ConfigError;
use crate::ingestion::SAREF_HAS_TIMESTAMP;
use crate::orchestrator::DecompositionPolicy;
use crate::publisher::PublishPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub experiment: ExperimentConfig,
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
    pub ingestion: IngestionConfig,
    pub decomposition: DecompositionPolicy,
    pub queries: QueriesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Number of iterations the analyzer summarizes
    pub iterations: u32,

    /// Cores used to normalize CPU percent; defaults to the logical core count
    pub num_cores: Option<usize>,

    /// Root of the `iteration<N>` directories
    pub logs_root: PathBuf,

    /// Event log file name inside an iteration directory
    pub event_log_file: Option<String>,

    /// Resource log file name inside an iteration directory
    pub resource_log_file: Option<String>,

    /// Summary CSV written by `analyze`
    pub summary_file: Option<PathBuf>,

    /// Event name marking query registration; defaults to the approach's marker
    pub registered_marker: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            iterations: 30,
            num_cores: None,
            logs_root: PathBuf::from("logs"),
            event_log_file: None,
            resource_log_file: None,
            summary_file: None,
            registered_marker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 100,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Broker the aggregation events are published to
    pub broker_url: String,

    pub topic: String,

    /// Unit IRI attached to every aggregation event
    pub unit: Option<String>,

    pub policy: PublishPolicy,

    /// Result ticks buffered per registration and again in front of the
    /// publisher; ticks beyond that are dropped and counted
    pub queue_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883/".to_string(),
            topic: "output".to_string(),
            unit: None,
            policy: PublishPolicy::DropWhenFull,
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub timestamp_predicate: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            timestamp_predicate: SAREF_HAS_TIMESTAMP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueriesConfig {
    /// Combined multi-stream query text
    pub combined: Option<String>,

    /// File holding the combined query; used when `combined` is unset
    pub combined_file: Option<PathBuf>,

    /// Explicit sub-queries for the approximation approach. When empty, they
    /// are derived by decomposing the combined query.
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,

    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment.iterations == 0 {
            return Err(ConfigError::Invalid("experiment.iterations must be at least 1".into()));
        }
        if self.experiment.num_cores == Some(0) {
            return Err(ConfigError::Invalid("experiment.num_cores must be at least 1".into()));
        }
        if self.output.queue_capacity == 0 {
            return Err(ConfigError::Invalid("output.queue_capacity must be at least 1".into()));
        }
        for (name, value) in [
            ("decomposition.range_ms", self.decomposition.range_ms),
            ("decomposition.step_ms", self.decomposition.step_ms),
        ] {
            if value.is_some_and(|v| v <= 0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn num_cores(&self) -> usize {
        self.experiment.num_cores.unwrap_or_else(num_cpus::get)
    }

    /// The combined query: inline text, then the configured file, then the
    /// built-in accelerometer query.
    pub fn combined_query(&self) -> Result<String, ConfigError> {
        if let Some(query) = &self.queries.combined {
            return Ok(query.clone());
        }
        if let Some(path) = &self.queries.combined_file {
            return std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(path.clone(), e.to_string()));
        }
        Ok(DEFAULT_COMBINED_QUERY.to_string())
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        iteration_dir(&self.experiment.logs_root, iteration)
    }

    pub fn event_log_file(&self, kind: ApproachKind) -> String {
        self.experiment
            .event_log_file
            .clone()
            .unwrap_or_else(|| format!("{}_log.csv", kind.name()))
    }

    pub fn resource_log_file(&self, kind: ApproachKind) -> String {
        self.experiment
            .resource_log_file
            .clone()
            .unwrap_or_else(|| format!("{}_resource_usage.csv", kind.name()))
    }

    pub fn event_log_path(&self, kind: ApproachKind, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join(self.event_log_file(kind))
    }

    pub fn resource_log_path(&self, kind: ApproachKind, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join(self.resource_log_file(kind))
    }

    pub fn analyzer_config(&self, kind: ApproachKind) -> AnalyzerConfig {
        AnalyzerConfig {
            logs_root: self.experiment.logs_root.clone(),
            iterations: self.experiment.iterations,
            num_cores: self.num_cores(),
            event_log_file: self.event_log_file(kind),
            resource_log_file: self.resource_log_file(kind),
            registered_marker: self
                .experiment
                .registered_marker
                .clone()
                .unwrap_or_else(|| kind.registered_marker().to_string()),
            summary_path: self.experiment.summary_file.clone().unwrap_or_else(|| {
                self.experiment
                    .logs_root
                    .join(format!("{}_latency_summary.csv", kind.name()))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.experiment.iterations, 30);
        assert_eq!(config.monitor.interval(), Duration::from_millis(100));
        assert_eq!(config.output.policy, PublishPolicy::DropWhenFull);
        assert_eq!(config.decomposition, DecompositionPolicy::default());
        assert!(config.num_cores() >= 1);
    }

    #[test]
    fn test_toml_parsing() {
        let toml = r#"
[experiment]
iterations = 3
num_cores = 8
logs_root = "/tmp/runs"

[output]
topic = "avg"
policy = "wait"

[decomposition]
range_ms = 120000
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.experiment.iterations, 3);
        assert_eq!(config.num_cores(), 8);
        assert_eq!(config.output.topic, "avg");
        assert_eq!(config.output.policy, PublishPolicy::Wait);
        assert_eq!(config.decomposition.range_ms, Some(120_000));
        assert_eq!(config.decomposition.step_ms, None);
        assert_eq!(
            config.event_log_path(ApproachKind::Approximation, 2),
            PathBuf::from("/tmp/runs/iteration2/approximation_log.csv")
        );
    }

    #[test]
    fn test_empty_decomposition_table_preserves_windows() {
        let config = Config::from_toml("[decomposition]\n").unwrap();
        assert_eq!(config.decomposition, DecompositionPolicy::preserve());

        let config = Config::from_toml("[decomposition]\nstep_ms = 15000\n").unwrap();
        assert_eq!(config.decomposition.range_ms, None);
        assert_eq!(config.decomposition.step_ms, Some(15_000));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml("[experiment]\niterations = 0\n").is_err());
        assert!(Config::from_toml("[decomposition]\nstep_ms = -5\n").is_err());
        assert!(Config::from_toml("experiment = 3").is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let example = Config::example_toml();
        assert!(example.contains("[experiment]"));
        assert!(Config::from_toml(&example).is_ok());
    }

    #[test]
    fn test_analyzer_config_uses_approach_marker() {
        let config = Config::default();
        let analyzer = config.analyzer_config(ApproachKind::Exact);
        assert_eq!(analyzer.registered_marker, "exact_query_registered");
        assert_eq!(analyzer.event_log_file, "exact_log.csv");
        assert_eq!(analyzer.resource_log_file, "exact_resource_usage.csv");
    }
}
