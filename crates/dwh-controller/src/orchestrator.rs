//! Single-flight run orchestration.
//!
//! At most one run is active at a time. Starting a run checks and claims the
//! execution slot under the same lock acquisition that spawns the worker, so
//! two concurrent requests can never both start. A request made while a run
//! is active fails with [`RunRequestError::Busy`]; nothing is queued.
//!
//! Per run: `Idle -> Starting -> Running -> {Completed, Failed} -> Idle`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dwh_core::{
    parse_snapshot_timestamp, snapshot_dir_name, snapshot_timestamp_suffix, RunKind, RunRecord,
    StatusSnapshot, TIMESTAMP_FILE_END, TIMESTAMP_FILE_START,
};
use dwh_storage::{DwhFiles, SnapshotScanner};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::diagnostics::capture_error;
use crate::executor::{execute_isolated, Collaborators, JobPlan, JobReport};
use crate::schedule::{next_trigger, Schedule};
use crate::state::{read_marker, recover, ActiveRun, RunState};

/// Why a run request was turned down. No state is changed in any of these cases.
#[derive(Debug, Error)]
pub enum RunRequestError {
    #[error("cannot start a run while another one is running")]
    Busy,
    #[error("cannot run incremental without a prior complete snapshot; run a batch first")]
    NoSnapshotToExtend,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Handle on a started run. Dropping it does not affect the run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    kind: RunKind,
    join: JoinHandle<()>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// Wait until the run has finished and its outcome is recorded.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join.await.context("job worker panicked")
    }
}

pub struct Orchestrator {
    config: ControllerConfig,
    schedule: Schedule,
    scanner: SnapshotScanner,
    collaborators: Collaborators,
    state: Mutex<RunState>,
}

impl Orchestrator {
    /// Validate the configuration and rebuild the run state from disk. Any
    /// error here is fatal: the controller must not start half-initialized.
    pub async fn initialize(
        config: ControllerConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Arc<Self>> {
        let (schedule, scanner, state) = load(&config).await?;

        info!(
            base_dir = %scanner.base_dir().display(),
            prefix = scanner.prefix(),
            schedule = schedule.expression(),
            current = ?state.current_root(),
            "controller initialized"
        );

        Ok(Arc::new(Self {
            config,
            schedule,
            scanner,
            collaborators,
            state: Mutex::new(state),
        }))
    }

    /// Status as recovered from disk, without building a controller or
    /// touching any job.
    pub async fn inspect(config: &ControllerConfig) -> anyhow::Result<StatusSnapshot> {
        let (schedule, _, state) = load(config).await?;
        Ok(status_of(&schedule, &state))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Start a full extraction into a fresh snapshot root.
    pub async fn start_batch(self: &Arc<Self>) -> Result<RunHandle, RunRequestError> {
        let mut state = self.state.lock().await;
        if state.is_running() {
            return Err(RunRequestError::Busy);
        }

        let now = Utc::now();
        let output_root = self.new_snapshot_root(now, state.current()).await?;
        info!(output_root = %output_root.display(), "running batch extraction");

        let plan = JobPlan::Batch {
            output_root,
            resources: self.config.resource_list.clone(),
        };
        Ok(self.launch(&mut state, plan, now))
    }

    /// Start an incremental extraction on top of the current snapshot, followed
    /// by a merge into a fresh snapshot root.
    pub async fn start_incremental(self: &Arc<Self>) -> Result<RunHandle, RunRequestError> {
        let mut state = self.state.lock().await;
        if state.is_running() {
            return Err(RunRequestError::Busy);
        }
        let current = state
            .current()
            .cloned()
            .ok_or(RunRequestError::NoSnapshotToExtend)?;

        let since = current
            .read_timestamp(TIMESTAMP_FILE_START)
            .await
            .with_context(|| format!("reading since bound of {}", current.root().display()))?;
        let now = Utc::now();
        let merged_root = self.new_snapshot_root(now, Some(&current)).await?;
        current.archive_incremental_dir(now).await?;

        info!(
            dwh = %current.root().display(),
            since = %since,
            merged_root = %merged_root.display(),
            "running incremental extraction"
        );

        let plan = JobPlan::Incremental {
            current_root: current.root().to_path_buf(),
            incremental_root: current.incremental_run_path(),
            merged_root,
            since,
            resources: self.config.resource_list.clone(),
            shards: self.config.max_workers,
        };
        Ok(self.launch(&mut state, plan, now))
    }

    /// One scheduler poll: start an incremental run if the next trigger is in
    /// the past. A busy controller is skipped silently; the anchor has not
    /// moved, so a later poll tries again.
    pub async fn poll_once(self: &Arc<Self>, now: DateTime<Utc>) -> Option<RunHandle> {
        let (last_success, next) = {
            let state = self.state.lock().await;
            (
                state.last_success(),
                next_trigger(&self.schedule, state.last_success(), state.is_running()),
            )
        };
        let next = next?;
        debug!(last_run = ?last_success, next_run = %next, "checked incremental schedule");
        if next >= now {
            return None;
        }

        info!(at = %now, "incremental run triggered");
        match self.start_incremental().await {
            Ok(handle) => Some(handle),
            Err(RunRequestError::Busy) => {
                debug!("incremental trigger skipped; a run is active");
                None
            }
            Err(err) => {
                warn!(error = %err, "incremental trigger rejected");
                None
            }
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        status_of(&self.schedule, &*self.state.lock().await)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_running()
    }

    pub async fn active_run(&self) -> Option<ActiveRun> {
        self.state.lock().await.active().cloned()
    }

    pub async fn current_root(&self) -> Option<String> {
        self.state.lock().await.current_root()
    }

    pub async fn next_trigger(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        next_trigger(&self.schedule, state.last_success(), state.is_running())
    }

    pub async fn last_run(&self) -> Option<RunRecord> {
        self.state.lock().await.last_run().cloned()
    }

    /// Register tables for every complete snapshot already on disk; the newest
    /// one also backs the canonical tables. Best-effort: failures are logged.
    pub async fn register_existing_tables(&self) {
        if !self.config.create_resource_tables {
            return;
        }
        let snapshots = match self.scanner.list().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "cannot list snapshots for table registration");
                return;
            }
        };
        let registrable: Vec<_> = snapshots
            .into_iter()
            .filter(|s| s.timestamp.is_some() && s.complete)
            .collect();
        let newest = registrable.len();
        for (idx, snapshot) in registrable.iter().enumerate() {
            self.register_snapshot_tables(&snapshot.root, idx + 1 == newest)
                .await;
        }
    }

    /// Claim the slot, open the run record and hand the plan to a worker task.
    /// Must be called with the state lock held.
    fn launch(
        self: &Arc<Self>,
        state: &mut RunState,
        plan: JobPlan,
        now: DateTime<Utc>,
    ) -> RunHandle {
        let kind = plan.kind();
        let record = RunRecord::started(kind, now);
        let run_id = record.run_id;
        state.begin(
            ActiveRun {
                run_id,
                kind,
                started_at: now,
            },
            record.clone(),
        );

        let orchestrator = Arc::clone(self);
        let span = info_span!("dwh_run", %run_id, kind = ?kind);
        let join = tokio::spawn(
            async move {
                let report =
                    execute_isolated(plan.clone(), orchestrator.collaborators.clone()).await;
                orchestrator.finish(&plan, record, report).await;
            }
            .instrument(span),
        );
        RunHandle { run_id, kind, join }
    }

    async fn finish(&self, plan: &JobPlan, record: RunRecord, report: JobReport) {
        match report {
            JobReport::Completed { final_root } => {
                let finished_at = Utc::now();
                let record = match &final_root {
                    Some(root) => {
                        let files = DwhFiles::for_root(root);
                        let start = read_marker(&files, TIMESTAMP_FILE_START).await;
                        let end = read_marker(&files, TIMESTAMP_FILE_END)
                            .await
                            .unwrap_or(finished_at);
                        record.succeeded(Some(files.root_string()), start, end)
                    }
                    None => record.succeeded(
                        Some(plan.base_root().display().to_string()),
                        None,
                        finished_at,
                    ),
                };

                if let Some(root) = &final_root {
                    if self.config.create_resource_tables {
                        self.register_snapshot_tables(root, true).await;
                    }
                }

                info!(
                    current = ?record.snapshot_root,
                    advanced = final_root.is_some(),
                    "run succeeded"
                );
                let mut state = self.state.lock().await;
                state.complete_success(final_root.map(DwhFiles::for_root), record, finished_at);
            }
            JobReport::Failed { root, error } => {
                let chain = format!("{error:#}");
                error!(error = %chain, "exception while running job");
                let diagnostics = capture_error(&root, &error).await;
                let record = record.failed(Some(root.display().to_string()), diagnostics);

                let mut state = self.state.lock().await;
                state.complete_failure(record);
            }
        }
    }

    /// Fresh snapshot root named after `now`, bumped forward when that name is
    /// taken or would not sort after the current snapshot.
    async fn new_snapshot_root(
        &self,
        now: DateTime<Utc>,
        current: Option<&DwhFiles>,
    ) -> anyhow::Result<PathBuf> {
        let prefix = self.scanner.prefix();
        let mut at = now;
        let floor = current
            .and_then(|c| c.root().file_name())
            .and_then(|name| parse_snapshot_timestamp(prefix, &name.to_string_lossy()));
        if let Some(floor) = floor {
            if at <= floor {
                at = floor + chrono::Duration::seconds(1);
            }
        }

        loop {
            let root = self.scanner.snapshot_root(&snapshot_dir_name(prefix, at));
            let taken = tokio::fs::try_exists(&root)
                .await
                .with_context(|| format!("checking {}", root.display()))?;
            if !taken {
                return Ok(root);
            }
            at += chrono::Duration::seconds(1);
        }
    }

    async fn register_snapshot_tables(&self, root: &Path, canonical: bool) {
        let Some(name) = root.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        let Some(timestamp) = snapshot_timestamp_suffix(self.scanner.prefix(), &name) else {
            warn!(dir = %name, "snapshot name has no timestamp; skipping table registration");
            return;
        };
        let children = match DwhFiles::for_root(root).child_dirs().await {
            Ok(children) => children,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "cannot list snapshot resources");
                return;
            }
        };

        let registrar = &self.collaborators.registrar;
        for resource in self
            .config
            .resource_list
            .iter()
            .filter(|r| children.contains(r))
        {
            let path = root.join(resource);
            if let Err(err) = registrar.register_table(resource, timestamp, &path).await {
                warn!(resource = %resource, error = %err, "failed to register resource table");
            }
            if canonical {
                if let Err(err) = registrar.register_canonical_table(resource, &path).await {
                    warn!(resource = %resource, error = %err, "failed to register canonical table");
                }
            }
        }
    }
}

async fn load(
    config: &ControllerConfig,
) -> anyhow::Result<(Schedule, SnapshotScanner, RunState)> {
    config.validate()?;
    let schedule = Schedule::parse(&config.incremental_schedule)?;
    let scanner = SnapshotScanner::from_root_prefix(config.root_prefix())?;
    let state = recover(&scanner, Utc::now())
        .await
        .context("recovering DWH state from snapshot directories")?;
    Ok((schedule, scanner, state))
}

fn status_of(schedule: &Schedule, state: &RunState) -> StatusSnapshot {
    StatusSnapshot {
        running: state.is_running(),
        current_root: state.current_root(),
        last_success: state.last_success(),
        next_trigger: next_trigger(schedule, state.last_success(), state.is_running()),
        last_run: state.last_run().cloned(),
    }
}
