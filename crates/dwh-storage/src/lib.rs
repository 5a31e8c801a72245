//! Snapshot directory layout for the DWH: marker files, nested incremental runs,
//! atomic file writes and the root-directory scanner used for startup recovery.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dwh_core::{
    parse_snapshot_timestamp, INCREMENTAL_DIR, SNAPSHOT_TIMESTAMP_FORMAT, TIMESTAMP_FILE_END,
    TIMESTAMP_FILE_START,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dwh-storage";

/// Handle on one snapshot root (a top-level snapshot or a nested incremental run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwhFiles {
    root: PathBuf,
}

impl DwhFiles {
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_string(&self) -> String {
        self.root.display().to_string()
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// A snapshot is complete once both the start and end markers exist. The
    /// resource data inside the root is never inspected.
    pub async fn is_complete(&self) -> anyhow::Result<bool> {
        for marker in [TIMESTAMP_FILE_START, TIMESTAMP_FILE_END] {
            let path = self.file_path(marker);
            let exists = fs::try_exists(&path)
                .await
                .with_context(|| format!("checking marker {}", path.display()))?;
            if !exists {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn read_timestamp(&self, marker: &str) -> anyhow::Result<DateTime<Utc>> {
        let path = self.file_path(marker);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading timestamp marker {}", path.display()))?;
        DateTime::parse_from_rfc3339(text.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .with_context(|| format!("parsing timestamp marker {}", path.display()))
    }

    pub async fn write_timestamp(&self, marker: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.write_file(marker, at.to_rfc3339().as_bytes()).await?;
        Ok(())
    }

    pub fn incremental_run_path(&self) -> PathBuf {
        self.root.join(INCREMENTAL_DIR)
    }

    pub fn incremental_run(&self) -> DwhFiles {
        DwhFiles::for_root(self.incremental_run_path())
    }

    pub async fn has_incremental_dir(&self) -> anyhow::Result<bool> {
        is_dir(&self.incremental_run_path()).await
    }

    /// Move an existing `incremental_run` directory aside so a new incremental
    /// extraction starts from an empty root. The archive name is bumped past
    /// earlier archives from the same second. Returns the new location, if any.
    pub async fn archive_incremental_dir(
        &self,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<PathBuf>> {
        if !self.has_incremental_dir().await? {
            return Ok(None);
        }
        let from = self.incremental_run_path();
        let mut stamp = at;
        let to = loop {
            let candidate = self.root.join(format!(
                "{INCREMENTAL_DIR}_{}",
                stamp.format(SNAPSHOT_TIMESTAMP_FORMAT)
            ));
            let taken = fs::try_exists(&candidate)
                .await
                .with_context(|| format!("checking {}", candidate.display()))?;
            if !taken {
                break candidate;
            }
            stamp += chrono::Duration::seconds(1);
        };
        fs::rename(&from, &to)
            .await
            .with_context(|| format!("archiving {} -> {}", from.display(), to.display()))?;
        debug!(from = %from.display(), to = %to.display(), "archived previous incremental run");
        Ok(Some(to))
    }

    /// Names of the immediate child directories of this root.
    pub async fn child_dirs(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if file_type.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write `bytes` to `<root>/<name>` through a temp file and an atomic rename,
    /// creating the root if needed. Existing files are replaced.
    pub async fn write_file(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot root {}", self.root.display()))?;

        let target = self.file_path(name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            });
        }
        Ok(target)
    }
}

async fn is_dir(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("inspecting {}", path.display())),
    }
}

/// One child of the DWH base directory whose name starts with the snapshot prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedSnapshot {
    pub name: String,
    pub root: PathBuf,
    pub timestamp: Option<DateTime<Utc>>,
    pub complete: bool,
    /// Completeness of the nested `incremental_run` directory, if there is one.
    pub incremental: Option<bool>,
}

/// Lists snapshot directories under `base_dir` whose names start with `prefix`.
#[derive(Debug, Clone)]
pub struct SnapshotScanner {
    base_dir: PathBuf,
    prefix: String,
}

impl SnapshotScanner {
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Split a root prefix such as `/data/dwh/controller_DWH` into the base
    /// directory (`/data/dwh`) and the snapshot name prefix (`controller_DWH`).
    pub fn from_root_prefix(root_prefix: &str) -> anyhow::Result<Self> {
        let path = Path::new(root_prefix);
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("DWH root prefix {root_prefix:?} has no file-name component"))?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self::new(base_dir, prefix))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn snapshot_root(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Scan the base directory. Failing to read it is an error; names that
    /// start with the prefix but lack a valid timestamp are kept and logged,
    /// since the DWH may have been seeded outside this controller.
    pub async fn list(&self) -> anyhow::Result<Vec<ScannedSnapshot>> {
        let base = DwhFiles::for_root(&self.base_dir);
        let names = base
            .child_dirs()
            .await
            .with_context(|| format!("scanning DWH base directory {}", self.base_dir.display()))?;

        let mut snapshots = Vec::new();
        for name in names.into_iter().filter(|n| n.starts_with(&self.prefix)) {
            let timestamp = parse_snapshot_timestamp(&self.prefix, &name);
            if timestamp.is_none() {
                warn!(
                    dir = %name,
                    expected = %format!("{}_<{}>", self.prefix, SNAPSHOT_TIMESTAMP_FORMAT),
                    "DWH directory does not follow the snapshot naming convention"
                );
            }

            let files = DwhFiles::for_root(self.snapshot_root(&name));
            let complete = files.is_complete().await?;
            let incremental = if files.has_incremental_dir().await? {
                Some(files.incremental_run().is_complete().await?)
            } else {
                None
            };

            snapshots.push(ScannedSnapshot {
                root: files.root().to_path_buf(),
                name,
                timestamp,
                complete,
                incremental,
            });
        }
        Ok(snapshots)
    }
}
