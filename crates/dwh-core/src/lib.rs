//! Core domain model for the DWH controller: snapshot naming, run records and job metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dwh-core";

/// Marker written by the extraction job when it starts writing a snapshot.
pub const TIMESTAMP_FILE_START: &str = "timestamp_start.txt";
/// Marker written by the extraction (or merge) job once the snapshot is complete.
pub const TIMESTAMP_FILE_END: &str = "timestamp_end.txt";
/// Nested directory holding the output of an incremental extraction.
pub const INCREMENTAL_DIR: &str = "incremental_run";
/// Failure diagnostics file written under a snapshot root.
pub const ERROR_FILE_NAME: &str = "error.log";
/// Namespace shared by every metric published for a run.
pub const METRICS_NAMESPACE: &str = "dwh_pipeline";

/// Fixed-width, lexicographically sortable timestamp embedded in snapshot names.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const SNAPSHOT_TIMESTAMP_WIDTH: usize = 14;

/// Build the directory name of a snapshot created at `at`, e.g. `dwh_20230101000000`.
pub fn snapshot_dir_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}_{}", at.format(SNAPSHOT_TIMESTAMP_FORMAT))
}

/// Raw timestamp suffix of a well-formed snapshot name.
pub fn snapshot_timestamp_suffix<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    let suffix = name.strip_prefix(prefix)?.strip_prefix('_')?;
    if suffix.len() == SNAPSHOT_TIMESTAMP_WIDTH && suffix.bytes().all(|b| b.is_ascii_digit()) {
        Some(suffix)
    } else {
        None
    }
}

/// Creation time embedded in a snapshot name, or `None` when the name does not
/// follow the `<prefix>_<YYYYMMDDHHMMSS>` convention.
pub fn parse_snapshot_timestamp(prefix: &str, name: &str) -> Option<DateTime<Utc>> {
    let suffix = snapshot_timestamp_suffix(prefix, name)?;
    NaiveDateTime::parse_from_str(suffix, SNAPSHOT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Batch,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    NotRun,
    Success,
    Failure,
}

/// Outcome record of one executed or recovered run.
///
/// `end_time` is only set on success and `diagnostics` only on failure. A
/// record with status `NotRun` belongs to a run that has not been finalized yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// `None` for records synthesized at startup from a top-level snapshot,
    /// where the kind of run that produced it cannot be reconstructed.
    pub kind: Option<RunKind>,
    pub status: RunStatus,
    pub snapshot_root: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub diagnostics: Option<String>,
}

impl RunRecord {
    pub fn started(kind: RunKind, start_time: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind: Some(kind),
            status: RunStatus::NotRun,
            snapshot_root: None,
            start_time: Some(start_time),
            end_time: None,
            diagnostics: None,
        }
    }

    pub fn succeeded(
        mut self,
        snapshot_root: Option<String>,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
    ) -> Self {
        self.status = RunStatus::Success;
        self.snapshot_root = snapshot_root;
        if start_time.is_some() {
            self.start_time = start_time;
        }
        self.end_time = Some(end_time);
        self.diagnostics = None;
        self
    }

    pub fn failed(mut self, snapshot_root: Option<String>, diagnostics: Option<String>) -> Self {
        self.status = RunStatus::Failure;
        self.snapshot_root = snapshot_root;
        self.end_time = None;
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.status != RunStatus::NotRun
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub namespace: String,
    pub name: String,
}

impl MetricKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn flat_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

/// Counter and gauge results reported by an extraction or merge job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub counters: BTreeMap<MetricKey, i64>,
    pub gauges: BTreeMap<MetricKey, i64>,
}

impl JobMetrics {
    pub fn with_counter(mut self, namespace: &str, name: &str, value: i64) -> Self {
        self.counters.insert(MetricKey::new(namespace, name), value);
        self
    }

    pub fn with_gauge(mut self, namespace: &str, name: &str, value: i64) -> Self {
        self.gauges.insert(MetricKey::new(namespace, name), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }

    /// Flat `namespace_name -> value` mapping; a gauge wins over a counter of the same name.
    pub fn flatten(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.counters {
            out.insert(key.flat_name(), *value as f64);
        }
        for (key, value) in &self.gauges {
            out.insert(key.flat_name(), *value as f64);
        }
        out
    }
}

/// Point-in-time view of the controller, read under a single lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub current_root: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub last_run: Option<RunRecord>,
}

impl StatusSnapshot {
    pub fn last_status(&self) -> RunStatus {
        self.last_run
            .as_ref()
            .map(|record| record.status)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_names_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().unwrap();
        let later = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).single().unwrap();

        let a = snapshot_dir_name("dwh", earlier);
        let b = snapshot_dir_name("dwh", later);
        assert_eq!(a, "dwh_20230101000000");
        assert!(a < b);
        assert_eq!(parse_snapshot_timestamp("dwh", &b), Some(later));
    }

    #[test]
    fn malformed_names_have_no_timestamp() {
        assert_eq!(parse_snapshot_timestamp("dwh", "dwh_2023"), None);
        assert_eq!(parse_snapshot_timestamp("dwh", "dwh_2023010100000x"), None);
        assert_eq!(parse_snapshot_timestamp("dwh", "other_20230101000000"), None);
        assert_eq!(parse_snapshot_timestamp("dwh", "dwh_20231301000000"), None);
        assert_eq!(
            snapshot_timestamp_suffix("dwh", "dwh_20230101000000"),
            Some("20230101000000")
        );
    }

    #[test]
    fn flattened_metrics_join_namespace_and_name() {
        let metrics = JobMetrics::default()
            .with_counter(METRICS_NAMESPACE, "resources_fetched", 12)
            .with_gauge(METRICS_NAMESPACE, "total_resources", 40);
        let flat = metrics.flatten();
        assert_eq!(flat.get("dwh_pipeline_resources_fetched"), Some(&12.0));
        assert_eq!(flat.get("dwh_pipeline_total_resources"), Some(&40.0));
    }

    #[test]
    fn run_record_serializes_status_like_the_status_surface() {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().unwrap();
        let record = RunRecord::started(RunKind::Incremental, start).failed(
            Some("/dwh/dwh_20230101000000".into()),
            Some("/dwh/dwh_20230101000000/error.log".into()),
        );
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["status"], "FAILURE");
        assert_eq!(json["kind"], "incremental");
        assert!(json["end_time"].is_null());
    }
}
