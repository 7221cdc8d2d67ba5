//! Periodic sampling of process CPU time and memory into a CSV log.
//!
//! The log keeps the column layout `timestamp,cpu_user,cpu_system,rss,
//! heapTotal,heapUsed,heapUsedMB,external` so logs from different runs and
//! approaches can be analyzed the same way. For a native process the heap
//! columns carry virtual (`heapTotal`) and resident (`heapUsed`) memory, and
//! `external` is always zero.

use crate::error::MonitorError;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Column names of the resource log, in [`ResourceSample`] field order.
pub const HEADER: [&str; 8] = [
    "timestamp",
    "cpu_user",
    "cpu_system",
    "rss",
    "heapTotal",
    "heapUsed",
    "heapUsedMB",
    "external",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: i64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub rss: u64,
    #[serde(rename = "heapTotal")]
    pub heap_total: u64,
    #[serde(rename = "heapUsed")]
    pub heap_used: u64,
    #[serde(rename = "heapUsedMB")]
    pub heap_used_mb: f64,
    pub external: u64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reads cumulative CPU time and memory counters of the current process.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
    last_timestamp: i64,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            last_timestamp: i64::MIN,
        }
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let (resident, virtual_bytes) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.virtual_memory()))
            .unwrap_or((0, 0));

        let (cpu_user, cpu_system) = cpu_times_ms();

        // Wall clock may step backwards; samples must not
        let timestamp = chrono::Utc::now()
            .timestamp_millis()
            .max(self.last_timestamp);
        self.last_timestamp = timestamp;

        ResourceSample {
            timestamp,
            cpu_user: round2(cpu_user),
            cpu_system: round2(cpu_system),
            rss: resident,
            heap_total: virtual_bytes,
            heap_used: resident,
            heap_used_mb: round2(resident as f64 / 1024.0 / 1024.0),
            external: 0,
        }
    }
}

/// Cumulative (user, system) CPU time of this process in milliseconds.
#[cfg(unix)]
fn cpu_times_ms() -> (f64, f64) {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return (0.0, 0.0);
    }
    // SAFETY: zero-initialized and filled by a successful getrusage call.
    let usage = unsafe { usage.assume_init() };
    let millis = |tv: libc::timeval| tv.tv_sec as f64 * 1000.0 + tv.tv_usec as f64 / 1000.0;
    (millis(usage.ru_utime), millis(usage.ru_stime))
}

#[cfg(not(unix))]
fn cpu_times_ms() -> (f64, f64) {
    (0.0, 0.0)
}

pub struct ResourceUsageLogger;

impl ResourceUsageLogger {
    /// Start sampling into `path` every `interval`.
    ///
    /// The header line is written and flushed before sampling starts, and
    /// only when the file is new or empty, so several runs can append to the
    /// same log. Must be called from within a tokio runtime.
    pub fn start(path: impl AsRef<Path>, interval: Duration) -> Result<ResourceMonitor, MonitorError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MonitorError::Open(path.clone(), e))?;
        }
        // A file left empty by an earlier run still needs its header
        let write_header = std::fs::metadata(&path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MonitorError::Open(path.clone(), e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(HEADER)?;
            writer.flush().map_err(|e| MonitorError::Open(path.clone(), e))?;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let log_path = path.clone();
        let task = tokio::spawn(async move {
            let mut sampler = ProcessSampler::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut written = 0u64;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let sample = sampler.sample();
                        match writer.serialize(&sample).and_then(|_| writer.flush().map_err(csv::Error::from)) {
                            Ok(()) => written += 1,
                            Err(e) => error!(path = %log_path.display(), error = %e, "failed to write resource sample"),
                        }
                    }
                }
            }
            writer.flush().map_err(csv::Error::from)?;
            debug!(path = %log_path.display(), samples = written, "resource sampler stopped");
            Ok::<u64, MonitorError>(written)
        });

        info!(path = %path.display(), interval_ms = interval.as_millis() as u64, "resource usage logging started");
        Ok(ResourceMonitor {
            path,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }
}

/// Running sampler. Dropping it stops sampling; [`ResourceMonitor::stop`]
/// also waits for the final flush.
pub struct ResourceMonitor {
    path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<u64, MonitorError>>>,
}

impl ResourceMonitor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop sampling and return the number of samples written by this run.
    pub async fn stop(mut self) -> Result<u64, MonitorError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| MonitorError::Join(e.to_string()))?,
            None => Ok(0),
        }
    }
}
