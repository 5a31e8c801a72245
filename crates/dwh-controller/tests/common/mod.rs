#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dwh_adapters::{
    AdapterError, ExtractOutcome, ExtractRequest, Extractor, InMemoryMetrics, MergeRequest,
    Merger, TableRegistrar,
};
use dwh_controller::{Collaborators, ControllerConfig, Orchestrator};
use dwh_core::{JobMetrics, METRICS_NAMESPACE, TIMESTAMP_FILE_END, TIMESTAMP_FILE_START};
use dwh_storage::DwhFiles;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Write,
    NothingNew,
    Fail,
    Panic,
}

/// Extraction double that writes a complete snapshot (one directory per
/// requested resource plus both markers) unless told otherwise.
pub struct FakeExtractor {
    behavior: Mutex<Behavior>,
    gate: Option<Arc<Notify>>,
    pub requests: Mutex<Vec<ExtractRequest>>,
}

impl FakeExtractor {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            gate: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every extraction blocks until `gate` is notified.
    pub fn gated(behavior: Behavior, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            gate: Some(gate),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub async fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().await = behavior;
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractOutcome, AdapterError> {
        self.requests.lock().await.push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let behavior = *self.behavior.lock().await;
        match behavior {
            Behavior::Write => {
                write_snapshot(&request.output_root, &request.resources).await?;
                Ok(ExtractOutcome::Written {
                    metrics: JobMetrics::default().with_counter(
                        METRICS_NAMESPACE,
                        "resources_fetched",
                        request.resources.len() as i64,
                    ),
                })
            }
            Behavior::NothingNew => Ok(ExtractOutcome::NoNewData {
                metrics: JobMetrics::default(),
            }),
            Behavior::Fail => Err(AdapterError::Message(
                "upstream FHIR server unavailable".to_string(),
            )),
            Behavior::Panic => panic!("extractor crashed"),
        }
    }
}

/// Merge double that writes a complete snapshot carrying the resources of the
/// first input.
#[derive(Default)]
pub struct FakeMerger {
    pub fail: bool,
    pub requests: Mutex<Vec<MergeRequest>>,
}

impl FakeMerger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Merger for FakeMerger {
    async fn merge(&self, request: &MergeRequest) -> Result<JobMetrics, AdapterError> {
        self.requests.lock().await.push(request.clone());
        if self.fail {
            return Err(AdapterError::Message("merge ran out of disk".to_string()));
        }
        let resources = DwhFiles::for_root(&request.first).child_dirs().await?;
        write_snapshot(&request.output, &resources).await?;
        Ok(JobMetrics::default().with_gauge(METRICS_NAMESPACE, "merge_shards", request.shards as i64))
    }
}

#[derive(Default)]
pub struct RecordingRegistrar {
    pub tables: Mutex<Vec<(String, String, PathBuf)>>,
    pub canonical: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl TableRegistrar for RecordingRegistrar {
    async fn register_table(
        &self,
        resource: &str,
        timestamp: &str,
        path: &Path,
    ) -> Result<(), AdapterError> {
        self.tables.lock().await.push((
            resource.to_string(),
            timestamp.to_string(),
            path.to_path_buf(),
        ));
        Ok(())
    }

    async fn register_canonical_table(
        &self,
        resource: &str,
        path: &Path,
    ) -> Result<(), AdapterError> {
        self.canonical
            .lock()
            .await
            .push((resource.to_string(), path.to_path_buf()));
        Ok(())
    }
}

pub async fn write_snapshot(root: &Path, resources: &[String]) -> Result<(), AdapterError> {
    let files = DwhFiles::for_root(root);
    files.write_timestamp(TIMESTAMP_FILE_START, Utc::now()).await?;
    for resource in resources {
        tokio::fs::create_dir_all(root.join(resource))
            .await
            .map_err(|err| AdapterError::Message(err.to_string()))?;
    }
    files.write_timestamp(TIMESTAMP_FILE_END, Utc::now()).await?;
    Ok(())
}

pub fn config_for(base: &Path) -> ControllerConfig {
    ControllerConfig {
        dwh_root_prefix: base.join("dwh").display().to_string(),
        resource_list: vec!["Patient".to_string(), "Encounter".to_string()],
        ..Default::default()
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub extractor: Arc<FakeExtractor>,
    pub merger: Arc<FakeMerger>,
    pub registrar: Arc<RecordingRegistrar>,
    pub metrics: Arc<InMemoryMetrics>,
}

pub async fn harness(
    config: ControllerConfig,
    extractor: Arc<FakeExtractor>,
    merger: Arc<FakeMerger>,
) -> Harness {
    let registrar = Arc::new(RecordingRegistrar::default());
    let metrics = Arc::new(InMemoryMetrics::new());
    let collaborators = Collaborators::new(extractor.clone(), merger.clone())
        .with_registrar(registrar.clone())
        .with_metrics(metrics.clone());
    let orchestrator = Orchestrator::initialize(config, collaborators)
        .await
        .expect("initialize");
    Harness {
        orchestrator,
        extractor,
        merger,
        registrar,
        metrics,
    }
}
