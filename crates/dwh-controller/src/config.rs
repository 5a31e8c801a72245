use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid controller configuration: {0}")]
    Invalid(String),
    #[error("unparsable incremental schedule {expression:?}: {reason}")]
    Schedule { expression: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Base directory plus snapshot name prefix, e.g. `/data/dwh/controller_DWH`.
    pub dwh_root_prefix: String,
    pub incremental_schedule: String,
    pub poll_interval_secs: u64,
    pub resource_list: Vec<String>,
    /// Shard count handed to the merge job.
    pub max_workers: usize,
    pub create_resource_tables: bool,
    pub extract_command: Option<String>,
    pub merge_command: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dwh_root_prefix: "./dwh/controller_DWH".to_string(),
            incremental_schedule: "0 0 * * * *".to_string(),
            poll_interval_secs: 30,
            resource_list: vec![
                "Patient".to_string(),
                "Encounter".to_string(),
                "Observation".to_string(),
            ],
            max_workers: 1,
            create_resource_tables: false,
            extract_command: None,
            merge_command: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dwh_root_prefix: std::env::var("DWH_ROOT_PREFIX").unwrap_or(defaults.dwh_root_prefix),
            incremental_schedule: std::env::var("DWH_INCREMENTAL_SCHEDULE")
                .unwrap_or(defaults.incremental_schedule),
            poll_interval_secs: std::env::var("DWH_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.poll_interval_secs),
            resource_list: std::env::var("DWH_RESOURCE_LIST")
                .map(|v| split_resource_list(&v))
                .unwrap_or(defaults.resource_list),
            max_workers: std::env::var("DWH_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_workers),
            create_resource_tables: std::env::var("DWH_CREATE_TABLES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            extract_command: std::env::var("DWH_EXTRACT_CMD").ok(),
            merge_command: std::env::var("DWH_MERGE_CMD").ok(),
        }
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The configured root prefix without surrounding whitespace.
    pub fn root_prefix(&self) -> &str {
        self.dwh_root_prefix.trim()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Checks everything that must hold before the controller may start. The
    /// cron expression is checked separately when the schedule is parsed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.root_prefix();
        if prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "dwh_root_prefix must not be empty".to_string(),
            ));
        }
        if prefix.ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "dwh_root_prefix {prefix:?} must end with a snapshot name prefix, not a directory"
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_workers must be positive".to_string(),
            ));
        }
        if self.resource_list.iter().all(|r| r.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "resource_list must name at least one resource".to_string(),
            ));
        }
        Ok(())
    }
}

fn split_resource_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        ControllerConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn mandatory_fields_are_enforced() {
        let empty_prefix = ControllerConfig {
            dwh_root_prefix: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(empty_prefix.validate(), Err(ConfigError::Invalid(_))));

        let dir_prefix = ControllerConfig {
            dwh_root_prefix: "/data/dwh/".into(),
            ..Default::default()
        };
        assert!(dir_prefix.validate().is_err());

        let no_resources = ControllerConfig {
            resource_list: vec![],
            ..Default::default()
        };
        assert!(no_resources.validate().is_err());
    }

    #[test]
    fn root_prefix_is_trimmed_for_validation_and_use() {
        let padded = ControllerConfig {
            dwh_root_prefix: " /data/dwh/snap \n".into(),
            ..Default::default()
        };
        padded.validate().expect("padded prefix validates");
        assert_eq!(padded.root_prefix(), "/data/dwh/snap");
    }

    #[test]
    fn resource_list_splitting_drops_blanks() {
        assert_eq!(
            split_resource_list(" Patient, ,Encounter,"),
            vec!["Patient".to_string(), "Encounter".to_string()]
        );
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("controller.yaml");
        std::fs::write(
            &path,
            "dwh_root_prefix: /tmp/dwh/snap\nincremental_schedule: \"0 */15 * * * *\"\nmax_workers: 4\n",
        )
        .expect("write yaml");

        let config = ControllerConfig::from_yaml_file(&path).expect("parse yaml");
        assert_eq!(config.dwh_root_prefix, "/tmp/dwh/snap");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.poll_interval_secs, 30);
    }
}
