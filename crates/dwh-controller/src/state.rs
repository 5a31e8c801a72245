//! Run-state tracking and startup recovery.
//!
//! Everything the controller knows about the DWH after a restart is derived
//! from the snapshot directories on disk. [`select_recovery`] is the pure part
//! of that derivation and [`recover`] applies it, reading marker files.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dwh_core::{
    RunKind, RunRecord, RunStatus, ERROR_FILE_NAME, TIMESTAMP_FILE_END, TIMESTAMP_FILE_START,
};
use dwh_storage::{DwhFiles, ScannedSnapshot, SnapshotScanner};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The run currently owning the single execution slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
}

/// Shared mutable state of the controller. Always accessed under the
/// orchestrator's single lock so the flag, the pointer and the record are
/// never observed half-updated.
#[derive(Debug, Default)]
pub struct RunState {
    active: Option<ActiveRun>,
    current: Option<DwhFiles>,
    last_success: Option<DateTime<Utc>>,
    last_run: Option<RunRecord>,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&ActiveRun> {
        self.active.as_ref()
    }

    pub fn current(&self) -> Option<&DwhFiles> {
        self.current.as_ref()
    }

    pub fn current_root(&self) -> Option<String> {
        self.current.as_ref().map(DwhFiles::root_string)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.last_run.as_ref()
    }

    /// Claim the execution slot and open a fresh record for the run.
    pub(crate) fn begin(&mut self, active: ActiveRun, record: RunRecord) {
        self.active = Some(active);
        self.last_run = Some(record);
    }

    /// Finalize a successful run. The slot is released in the same step.
    pub(crate) fn complete_success(
        &mut self,
        new_current: Option<DwhFiles>,
        record: RunRecord,
        finished_at: DateTime<Utc>,
    ) {
        if let Some(current) = new_current {
            self.current = Some(current);
        }
        self.last_success = Some(finished_at);
        self.last_run = Some(record);
        self.active = None;
    }

    /// Finalize a failed run; the current pointer is left untouched.
    pub(crate) fn complete_failure(&mut self, record: RunRecord) {
        self.last_run = Some(record);
        self.active = None;
    }
}

/// Where the last-run record is synthesized from at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRunSource {
    pub root: PathBuf,
    pub incremental: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryPlan {
    pub latest: Option<String>,
    pub latest_complete: Option<ScannedSnapshot>,
    pub last_run_source: Option<LastRunSource>,
}

/// Pick the current snapshot and the last-run source from a directory listing.
///
/// The current pointer is the greatest complete name. The last run is read
/// from the greatest name overall, preferring its nested incremental run when
/// one exists, since that is the most recent work attempted.
pub fn select_recovery(snapshots: &[ScannedSnapshot]) -> RecoveryPlan {
    let latest = snapshots.iter().max_by(|a, b| a.name.cmp(&b.name));
    let latest_complete = snapshots
        .iter()
        .filter(|s| s.complete)
        .max_by(|a, b| a.name.cmp(&b.name));

    let last_run_source = latest.map(|snapshot| match snapshot.incremental {
        Some(complete) => LastRunSource {
            root: DwhFiles::for_root(&snapshot.root).incremental_run_path(),
            incremental: true,
            complete,
        },
        None => LastRunSource {
            root: snapshot.root.clone(),
            incremental: false,
            complete: snapshot.complete,
        },
    });

    RecoveryPlan {
        latest: latest.map(|s| s.name.clone()),
        latest_complete: latest_complete.cloned(),
        last_run_source,
    }
}

/// Rebuild the run state from disk. `now` becomes the last success time when a
/// complete snapshot exists, because the real completion time of that run is
/// not recorded anywhere and an early anchor would re-trigger immediately.
pub async fn recover(scanner: &SnapshotScanner, now: DateTime<Utc>) -> anyhow::Result<RunState> {
    let snapshots = scanner.list().await?;
    for snapshot in &snapshots {
        debug!(dir = %snapshot.name, complete = snapshot.complete, "found DWH snapshot");
    }
    let plan = select_recovery(&snapshots);

    let mut state = RunState::default();
    match &plan.latest_complete {
        Some(snapshot) => {
            info!(dwh = %snapshot.name, "initializing with most recent complete DWH");
            state.current = Some(DwhFiles::for_root(&snapshot.root));
            state.last_success = Some(now);
        }
        None => {
            info!("no complete DWH found; it should be created by running a batch");
        }
    }

    if let Some(source) = &plan.last_run_source {
        state.last_run = Some(synthesize_record(source).await);
    }
    Ok(state)
}

async fn synthesize_record(source: &LastRunSource) -> RunRecord {
    let files = DwhFiles::for_root(&source.root);
    let start_time = read_marker(&files, TIMESTAMP_FILE_START).await;

    let (status, end_time, diagnostics) = if source.complete {
        (
            RunStatus::Success,
            read_marker(&files, TIMESTAMP_FILE_END).await,
            None,
        )
    } else {
        let error_file = files.file_path(ERROR_FILE_NAME);
        let diagnostics = match tokio::fs::try_exists(&error_file).await {
            Ok(true) => Some(error_file.display().to_string()),
            _ => None,
        };
        (RunStatus::Failure, None, diagnostics)
    };

    RunRecord {
        run_id: Uuid::new_v4(),
        kind: source.incremental.then_some(RunKind::Incremental),
        status,
        snapshot_root: Some(files.root_string()),
        start_time,
        end_time,
        diagnostics,
    }
}

pub(crate) async fn read_marker(files: &DwhFiles, marker: &str) -> Option<DateTime<Utc>> {
    match files.read_timestamp(marker).await {
        Ok(ts) => Some(ts),
        Err(err) => {
            warn!(root = %files.root().display(), marker, error = %err, "could not read marker");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn scanned(name: &str, complete: bool, incremental: Option<bool>) -> ScannedSnapshot {
        ScannedSnapshot {
            name: name.to_string(),
            root: PathBuf::from("/dwh").join(name),
            timestamp: None,
            complete,
            incremental,
        }
    }

    #[test]
    fn greatest_complete_name_becomes_current() {
        let plan = select_recovery(&[
            scanned("dwh_20230103000000", false, None),
            scanned("dwh_20230101000000", true, None),
            scanned("dwh_20230102000000", true, None),
        ]);
        assert_eq!(
            plan.latest_complete.map(|s| s.name),
            Some("dwh_20230102000000".to_string())
        );
        assert_eq!(plan.latest.as_deref(), Some("dwh_20230103000000"));
        let source = plan.last_run_source.expect("source");
        assert!(!source.incremental);
        assert!(!source.complete);
    }

    #[test]
    fn incomplete_snapshots_never_become_current() {
        let plan = select_recovery(&[
            scanned("dwh_20230101000000", false, None),
            scanned("dwh_20230102000000", false, Some(true)),
        ]);
        assert_eq!(plan.latest_complete, None);
    }

    #[test]
    fn nested_incremental_run_drives_last_run_source() {
        let plan = select_recovery(&[
            scanned("dwh_20230101000000", true, None),
            scanned("dwh_20230102000000", false, Some(false)),
        ]);
        assert_eq!(
            plan.latest_complete.map(|s| s.name),
            Some("dwh_20230101000000".to_string())
        );
        assert_eq!(
            plan.last_run_source,
            Some(LastRunSource {
                root: PathBuf::from("/dwh/dwh_20230102000000/incremental_run"),
                incremental: true,
                complete: false,
            })
        );
    }

    #[test]
    fn empty_listing_recovers_nothing() {
        assert_eq!(select_recovery(&[]), RecoveryPlan::default());
    }

    #[tokio::test]
    async fn recovery_reads_markers_of_the_last_run() {
        let dir = tempdir().expect("tempdir");
        let day = |d| Utc.with_ymd_and_hms(2023, 1, d, 0, 0, 0).single().unwrap();
        let snapshot = DwhFiles::for_root(dir.path().join("dwh_20230101000000"));
        snapshot
            .write_timestamp(TIMESTAMP_FILE_START, day(1))
            .await
            .expect("start");
        snapshot
            .write_timestamp(TIMESTAMP_FILE_END, day(2))
            .await
            .expect("end");

        let now = day(20);
        let state = recover(&SnapshotScanner::new(dir.path(), "dwh"), now)
            .await
            .expect("recover");

        assert_eq!(state.current_root(), Some(snapshot.root_string()));
        assert_eq!(state.last_success(), Some(now));
        assert!(!state.is_running());
        let record = state.last_run().expect("record");
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.kind, None);
        assert_eq!(record.start_time, Some(day(1)));
        assert_eq!(record.end_time, Some(day(2)));
    }

    #[tokio::test]
    async fn interrupted_incremental_run_is_recovered_as_failure() {
        let dir = tempdir().expect("tempdir");
        let day = |d| Utc.with_ymd_and_hms(2023, 1, d, 0, 0, 0).single().unwrap();
        let complete = DwhFiles::for_root(dir.path().join("dwh_20230101000000"));
        complete
            .write_timestamp(TIMESTAMP_FILE_START, day(1))
            .await
            .expect("start");
        complete
            .write_timestamp(TIMESTAMP_FILE_END, day(1))
            .await
            .expect("end");
        let newer = DwhFiles::for_root(dir.path().join("dwh_20230102000000"));
        newer
            .write_timestamp(TIMESTAMP_FILE_START, day(2))
            .await
            .expect("start");
        let nested = newer.incremental_run();
        nested
            .write_timestamp(TIMESTAMP_FILE_START, day(3))
            .await
            .expect("nested start");

        let scanner = SnapshotScanner::new(dir.path(), "dwh");
        let state = recover(&scanner, day(20)).await.expect("recover");
        assert_eq!(state.current_root(), Some(complete.root_string()));
        let record = state.last_run().expect("record");
        assert_eq!(record.status, RunStatus::Failure);
        assert_eq!(record.kind, Some(RunKind::Incremental));
        assert_eq!(record.snapshot_root, Some(nested.root_string()));
        assert_eq!(record.start_time, Some(day(3)));
        assert_eq!(record.end_time, None);
        assert_eq!(record.diagnostics, None);

        let log = nested
            .write_file(ERROR_FILE_NAME, b"merge failed\n")
            .await
            .expect("error log");
        let state = recover(&scanner, day(20)).await.expect("recover again");
        let record = state.last_run().expect("record");
        assert_eq!(record.diagnostics, Some(log.display().to_string()));
    }

    #[tokio::test]
    async fn empty_root_leaves_no_anchor() {
        let dir = tempdir().expect("tempdir");
        let state = recover(&SnapshotScanner::new(dir.path(), "dwh"), Utc::now())
            .await
            .expect("recover");
        assert_eq!(state.current_root(), None);
        assert_eq!(state.last_success(), None);
        assert_eq!(state.last_run(), None);
    }
}
