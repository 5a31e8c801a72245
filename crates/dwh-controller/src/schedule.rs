//! Cron-driven trigger computation for incremental runs.
//!
//! The schedule is polled rather than event-driven: every poll recomputes the
//! next trigger from the anchor (the last successful run's end), so trigger
//! precision is bounded by the poll interval. A trigger that is skipped
//! because a run is active is picked up again by a later poll since the
//! anchor only moves on success.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::ConfigError;
use crate::orchestrator::Orchestrator;

/// A parsed cron expression (5 fields, or 6 with leading seconds), evaluated in UTC.
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let cron = Cron::new(expression.trim())
            .with_seconds_optional()
            .parse()
            .map_err(|err| ConfigError::Schedule {
                expression: expression.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Smallest instant matching the expression strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .finish()
    }
}

/// Next time an incremental run is due, or `None` while a run is active or
/// before any run has succeeded.
pub fn next_trigger(
    schedule: &Schedule,
    last_success: Option<DateTime<Utc>>,
    running: bool,
) -> Option<DateTime<Utc>> {
    if running {
        return None;
    }
    schedule.next_after(last_success?)
}

/// Build the poll loop: a repeated job that calls [`Orchestrator::poll_once`]
/// every `interval`. The caller starts (and eventually shuts down) the scheduler.
pub async fn build_poll_scheduler(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating poll scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            orchestrator.poll_once(Utc::now()).await;
        })
    })
    .with_context(|| format!("creating poll job every {interval:?}"))?;
    sched.add(job).await.context("adding poll job")?;
    Ok(sched)
}
