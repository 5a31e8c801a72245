//! Contracts for the jobs the controller drives (extraction, merge, table
//! registration, metrics export) plus the stock implementations the CLI wires in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dwh_core::{JobMetrics, TIMESTAMP_FILE_START};
use dwh_storage::DwhFiles;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dwh-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("command `{command}` exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Parameters for one extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub output_root: PathBuf,
    /// Only fetch data changed after this instant; `None` for a full extraction.
    pub since: Option<DateTime<Utc>>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    /// A snapshot with start/end markers was written to the output root.
    Written { metrics: JobMetrics },
    /// Nothing changed since the `since` bound; no snapshot was produced.
    NoNewData { metrics: JobMetrics },
}

impl ExtractOutcome {
    pub fn metrics(&self) -> &JobMetrics {
        match self {
            ExtractOutcome::Written { metrics } | ExtractOutcome::NoNewData { metrics } => metrics,
        }
    }
}

/// Parameters for merging two snapshots into a third.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub first: PathBuf,
    pub second: PathBuf,
    pub output: PathBuf,
    pub shards: usize,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractOutcome, AdapterError>;
}

#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, request: &MergeRequest) -> Result<JobMetrics, AdapterError>;
}

/// Registers queryable tables over snapshot data. Implementations must be idempotent.
#[async_trait]
pub trait TableRegistrar: Send + Sync {
    async fn register_table(
        &self,
        resource: &str,
        timestamp: &str,
        path: &Path,
    ) -> Result<(), AdapterError>;

    async fn register_canonical_table(&self, resource: &str, path: &Path)
        -> Result<(), AdapterError>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn remove_by_prefix(&self, prefix: &str);
    async fn publish(&self, metrics: &BTreeMap<String, f64>);
}

#[derive(Debug, Default)]
pub struct NoopTableRegistrar;

#[async_trait]
impl TableRegistrar for NoopTableRegistrar {
    async fn register_table(
        &self,
        resource: &str,
        timestamp: &str,
        path: &Path,
    ) -> Result<(), AdapterError> {
        debug!(resource, timestamp, path = %path.display(), "table registration disabled");
        Ok(())
    }

    async fn register_canonical_table(
        &self,
        resource: &str,
        path: &Path,
    ) -> Result<(), AdapterError> {
        debug!(resource, path = %path.display(), "canonical table registration disabled");
        Ok(())
    }
}

/// Process-local gauge registry.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, f64> {
        self.gauges.lock().await.clone()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn remove_by_prefix(&self, prefix: &str) {
        self.gauges
            .lock()
            .await
            .retain(|name, _| !name.starts_with(prefix));
    }

    async fn publish(&self, metrics: &BTreeMap<String, f64>) {
        let mut gauges = self.gauges.lock().await;
        for (name, value) in metrics {
            gauges.insert(name.clone(), *value);
        }
    }
}

/// Runs an external extraction job through `sh -c`.
///
/// The job receives `DWH_OUTPUT_ROOT`, `DWH_RESOURCES` (comma separated) and,
/// for incremental runs, `DWH_SINCE` (RFC 3339). Exiting successfully without
/// writing a start marker under the output root means there was no new data.
/// Stdout lines of the form `metric <counter|gauge> <namespace> <name> <value>`
/// are collected as job metrics.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    command: String,
}

impl CommandExtractor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractOutcome, AdapterError> {
        let mut envs = vec![
            (
                "DWH_OUTPUT_ROOT".to_string(),
                request.output_root.display().to_string(),
            ),
            ("DWH_RESOURCES".to_string(), request.resources.join(",")),
        ];
        if let Some(since) = request.since {
            envs.push(("DWH_SINCE".to_string(), since.to_rfc3339()));
        }

        let stdout = run_shell(&self.command, &envs).await?;
        let metrics = parse_metrics(&stdout);

        let marker = DwhFiles::for_root(&request.output_root).file_path(TIMESTAMP_FILE_START);
        let written = tokio::fs::try_exists(&marker)
            .await
            .map_err(|err| AdapterError::Message(format!("checking {}: {err}", marker.display())))?;
        if written {
            Ok(ExtractOutcome::Written { metrics })
        } else {
            info!(output_root = %request.output_root.display(), "extraction reported no new data");
            Ok(ExtractOutcome::NoNewData { metrics })
        }
    }
}

/// Runs an external merge job through `sh -c` with `DWH_MERGE_FIRST`,
/// `DWH_MERGE_SECOND`, `DWH_MERGE_OUTPUT` and `DWH_MERGE_SHARDS` set.
#[derive(Debug, Clone)]
pub struct CommandMerger {
    command: String,
}

impl CommandMerger {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Merger for CommandMerger {
    async fn merge(&self, request: &MergeRequest) -> Result<JobMetrics, AdapterError> {
        let envs = vec![
            (
                "DWH_MERGE_FIRST".to_string(),
                request.first.display().to_string(),
            ),
            (
                "DWH_MERGE_SECOND".to_string(),
                request.second.display().to_string(),
            ),
            (
                "DWH_MERGE_OUTPUT".to_string(),
                request.output.display().to_string(),
            ),
            ("DWH_MERGE_SHARDS".to_string(), request.shards.to_string()),
        ];
        let stdout = run_shell(&self.command, &envs).await?;
        Ok(parse_metrics(&stdout))
    }
}

async fn run_shell(command: &str, envs: &[(String, String)]) -> Result<String, AdapterError> {
    info!(cmd = %command, "starting job process");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .await
        .map_err(|err| AdapterError::Message(format!("spawning `{command}`: {err}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    for line in stderr.lines() {
        debug!(cmd = %command, "stderr: {}", line);
    }

    info!(
        cmd = %command,
        exit_code = output.status.code().unwrap_or(-1),
        success = output.status.success(),
        "job process exited"
    );

    if !output.status.success() {
        return Err(AdapterError::Command {
            command: command.to_string(),
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_metrics(stdout: &str) -> JobMetrics {
    let mut metrics = JobMetrics::default();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["metric", kind, namespace, name, value] => {
                let Ok(value) = value.parse::<i64>() else {
                    warn!(line, "ignoring metric with a non-integer value");
                    continue;
                };
                metrics = match *kind {
                    "counter" => metrics.with_counter(namespace, name, value),
                    "gauge" => metrics.with_gauge(namespace, name, value),
                    other => {
                        warn!(kind = other, "ignoring metric of unknown kind");
                        metrics
                    }
                };
            }
            _ => {}
        }
    }
    metrics
}
