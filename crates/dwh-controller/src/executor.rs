//! The extract (+ merge) workflow run by the single job worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dwh_adapters::{
    ExtractOutcome, ExtractRequest, Extractor, InMemoryMetrics, MergeRequest, Merger,
    MetricsSink, NoopTableRegistrar, TableRegistrar,
};
use dwh_core::{JobMetrics, RunKind, METRICS_NAMESPACE};
use dwh_storage::DwhFiles;
use tracing::info;

/// The external jobs and sinks the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub merger: Arc<dyn Merger>,
    pub registrar: Arc<dyn TableRegistrar>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Collaborators {
    pub fn new(extractor: Arc<dyn Extractor>, merger: Arc<dyn Merger>) -> Self {
        Self {
            extractor,
            merger,
            registrar: Arc::new(NoopTableRegistrar),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn TableRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Fully resolved parameters of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPlan {
    Batch {
        output_root: PathBuf,
        resources: Vec<String>,
    },
    Incremental {
        current_root: PathBuf,
        incremental_root: PathBuf,
        merged_root: PathBuf,
        since: DateTime<Utc>,
        resources: Vec<String>,
        shards: usize,
    },
}

impl JobPlan {
    pub fn kind(&self) -> RunKind {
        match self {
            JobPlan::Batch { .. } => RunKind::Batch,
            JobPlan::Incremental { .. } => RunKind::Incremental,
        }
    }

    /// Output root of the first stage; a failure that cannot be attributed to a
    /// later stage is reported here.
    pub fn first_stage_root(&self) -> &Path {
        match self {
            JobPlan::Batch { output_root, .. } => output_root,
            JobPlan::Incremental {
                incremental_root, ..
            } => incremental_root,
        }
    }

    /// Root the current pointer falls back to for a run that produced nothing new.
    pub fn base_root(&self) -> &Path {
        match self {
            JobPlan::Batch { output_root, .. } => output_root,
            JobPlan::Incremental { current_root, .. } => current_root,
        }
    }
}

#[derive(Debug)]
pub enum JobReport {
    /// `final_root` is the snapshot that should become current; `None` when an
    /// incremental extraction found nothing new.
    Completed { final_root: Option<PathBuf> },
    /// `root` is the output root of the stage that failed; diagnostics go there.
    Failed { root: PathBuf, error: anyhow::Error },
}

/// Run the workflow of `plan` to completion. Never returns early on failure:
/// every error is folded into [`JobReport::Failed`].
pub async fn execute(plan: &JobPlan, collaborators: &Collaborators) -> JobReport {
    match plan {
        JobPlan::Batch {
            output_root,
            resources,
        } => {
            let request = ExtractRequest {
                output_root: output_root.clone(),
                since: None,
                resources: resources.clone(),
            };
            match run_batch(&request, collaborators).await {
                Ok(()) => JobReport::Completed {
                    final_root: Some(output_root.clone()),
                },
                Err(error) => JobReport::Failed {
                    root: output_root.clone(),
                    error,
                },
            }
        }
        JobPlan::Incremental {
            current_root,
            incremental_root,
            merged_root,
            since,
            resources,
            shards,
        } => {
            let request = ExtractRequest {
                output_root: incremental_root.clone(),
                since: Some(*since),
                resources: resources.clone(),
            };
            let found_new_data = match extract(&request, collaborators).await {
                Ok(found) => found,
                Err(error) => {
                    return JobReport::Failed {
                        root: incremental_root.clone(),
                        error,
                    }
                }
            };
            if !found_new_data {
                info!(dwh = %current_root.display(), "no new resources since last snapshot");
                return JobReport::Completed { final_root: None };
            }

            let merge = MergeRequest {
                first: current_root.clone(),
                second: incremental_root.clone(),
                output: merged_root.clone(),
                shards: *shards,
            };
            match run_merge(&merge, collaborators).await {
                Ok(()) => JobReport::Completed {
                    final_root: Some(merged_root.clone()),
                },
                Err(error) => JobReport::Failed {
                    root: merged_root.clone(),
                    error,
                },
            }
        }
    }
}

/// Run [`execute`] on its own task so a panicking collaborator is reported as
/// a failure of the first stage instead of tearing down the caller.
pub async fn execute_isolated(plan: JobPlan, collaborators: Collaborators) -> JobReport {
    let root = plan.first_stage_root().to_path_buf();
    let job = tokio::spawn(async move { execute(&plan, &collaborators).await });
    match job.await {
        Ok(report) => report,
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|msg| msg.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            JobReport::Failed {
                root,
                error: anyhow!("job worker panicked: {message}"),
            }
        }
        Err(err) => JobReport::Failed {
            root,
            error: anyhow!("job worker was cancelled: {err}"),
        },
    }
}

async fn run_batch(request: &ExtractRequest, collaborators: &Collaborators) -> anyhow::Result<()> {
    if extract(request, collaborators).await? {
        Ok(())
    } else {
        Err(anyhow!(
            "batch extraction into {} produced no snapshot",
            request.output_root.display()
        ))
    }
}

/// Returns whether a snapshot was written. Replaces the published metrics
/// with this extraction's results.
async fn extract(request: &ExtractRequest, collaborators: &Collaborators) -> anyhow::Result<bool> {
    info!(
        output_root = %request.output_root.display(),
        since = ?request.since,
        "running extraction"
    );
    let outcome = collaborators
        .extractor
        .extract(request)
        .await
        .with_context(|| format!("extracting into {}", request.output_root.display()))?;

    collaborators.metrics.remove_by_prefix(METRICS_NAMESPACE).await;
    publish(collaborators, outcome.metrics()).await;

    match outcome {
        ExtractOutcome::NoNewData { .. } => Ok(false),
        ExtractOutcome::Written { .. } => {
            ensure_complete(&request.output_root).await?;
            Ok(true)
        }
    }
}

async fn run_merge(request: &MergeRequest, collaborators: &Collaborators) -> anyhow::Result<()> {
    info!(
        first = %request.first.display(),
        second = %request.second.display(),
        output = %request.output.display(),
        shards = request.shards,
        "running merge"
    );
    let metrics = collaborators
        .merger
        .merge(request)
        .await
        .with_context(|| format!("merging into {}", request.output.display()))?;
    publish(collaborators, &metrics).await;
    ensure_complete(&request.output).await
}

async fn publish(collaborators: &Collaborators, metrics: &JobMetrics) {
    if !metrics.is_empty() {
        collaborators.metrics.publish(&metrics.flatten()).await;
    }
}

async fn ensure_complete(root: &Path) -> anyhow::Result<()> {
    let files = DwhFiles::for_root(root);
    if files.is_complete().await? {
        Ok(())
    } else {
        Err(anyhow!(
            "job reported success but snapshot {} is missing its start/end markers",
            root.display()
        ))
    }
}
