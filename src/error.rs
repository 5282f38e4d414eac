use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of the diagnostic trail a pipeline accumulates while it runs.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub stage: String,
    pub message: String,
}

/// Append-only stage log for one migration/snapshot/restore invocation.
/// Attached to the raised error on failure; never persisted.
#[derive(Debug)]
pub struct PipelineLog {
    started: Instant,
    entries: Vec<LogEntry>,
}

impl PipelineLog {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, level: LogLevel, stage: &str, message: impl Into<String>) {
        self.entries.push(LogEntry {
            at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            level,
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    pub fn info(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Info, stage, message);
    }

    pub fn warn(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Warn, stage, message);
    }

    pub fn error(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Error, stage, message);
    }

    pub fn total_time_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

impl Default for PipelineLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure of a migration/snapshot/restore pipeline, carrying the stage at
/// which it occurred and the full accumulated log trail. Raised after the
/// best-effort rollback has been attempted; recover it from an
/// `anyhow::Error` with `downcast_ref::<PipelineError>()`.
#[derive(Debug)]
pub struct PipelineError {
    pub deployment_id: String,
    pub stage: String,
    pub total_time_ms: u64,
    pub logs: Vec<LogEntry>,
    pub source: anyhow::Error,
}

impl PipelineError {
    pub fn new(deployment_id: &str, stage: &str, log: PipelineLog, source: anyhow::Error) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            stage: stage.to_string(),
            total_time_ms: log.total_time_ms(),
            logs: log.into_entries(),
            source,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline failed at stage '{}' for deployment {}: {:#}",
            self.stage, self.deployment_id, self.source
        )
    }
}

impl std::error::Error for PipelineError {}

/// Storage ceiling violation, detected before any remote side effect where
/// possible. `required_bytes` is zero for the coarse pre-check and carries
/// the concrete archive size once one has been measured.
#[derive(Debug, Clone)]
pub struct QuotaError {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub required_bytes: u64,
}

impl fmt::Display for QuotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.required_bytes > 0 {
            write!(
                f,
                "snapshot storage quota exceeded: {} bytes used of {}, archive needs {} more",
                self.used_bytes, self.limit_bytes, self.required_bytes
            )
        } else {
            write!(
                f,
                "snapshot storage quota exhausted: {} bytes used of {}",
                self.used_bytes, self.limit_bytes
            )
        }
    }
}

impl std::error::Error for QuotaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_log_orders_entries() {
        let mut log = PipelineLog::new();
        log.info("Stop container", "stopping app-1");
        log.warn("Archive volumes", "mountpoint inspect failed; using default root");
        log.error("Create container", "docker create exited 125");

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].stage, "Stop container");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[2].level, LogLevel::Error);
    }

    #[test]
    fn pipeline_error_is_downcastable() {
        let mut log = PipelineLog::new();
        log.error("Create container", "boom");
        let err = PipelineError::new(
            "dep-1",
            "Create container",
            log,
            anyhow::anyhow!("docker create exited 125"),
        );
        let wrapped = anyhow::Error::new(err);
        let recovered = wrapped
            .downcast_ref::<PipelineError>()
            .expect("downcast pipeline error");
        assert_eq!(recovered.stage, "Create container");
        assert_eq!(recovered.logs.len(), 1);
    }

    #[test]
    fn quota_error_reports_both_checks() {
        let coarse = QuotaError {
            used_bytes: 10,
            limit_bytes: 10,
            required_bytes: 0,
        };
        assert!(coarse.to_string().contains("exhausted"));

        let concrete = QuotaError {
            used_bytes: 8,
            limit_bytes: 10,
            required_bytes: 5,
        };
        assert!(concrete.to_string().contains("needs 5 more"));
    }
}
