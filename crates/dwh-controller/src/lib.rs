//! Incremental DWH controller: recovers the current snapshot from disk, runs
//! batch and incremental extractions one at a time, and triggers incremental
//! runs on a cron schedule.

pub mod config;
pub mod diagnostics;
pub mod executor;
pub mod orchestrator;
pub mod schedule;
pub mod state;

pub use config::{ConfigError, ControllerConfig};
pub use executor::{Collaborators, JobPlan, JobReport};
pub use orchestrator::{Orchestrator, RunHandle, RunRequestError};
pub use schedule::{build_poll_scheduler, next_trigger, Schedule};
pub use state::{recover, select_recovery, ActiveRun, RunState};

pub const CRATE_NAME: &str = "dwh-controller";
