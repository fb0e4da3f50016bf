//! Minute-granularity cron scheduler with at-most-once firing semantics.
//!
//! The tick loop compares `now` against each job's precomputed next fire
//! time. Fires missed while the process was down are skipped, never
//! replayed: after every fire (or missed window) the next fire time is
//! recomputed from the current instant.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use fanout_core::{JobId, StrategyId, UserId};

use crate::StrategyTrigger;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("job not found")]
    NotFound,
}

/// One recurring strategy trigger.
#[derive(Clone, Debug)]
pub struct ScheduledJob {
    pub id: JobId,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub name: String,
    pub cron_expr: String,
    pub enabled: bool,
    pub context: Value,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

struct JobState {
    job: ScheduledJob,
    schedule: Schedule,
}

/// In-memory job table driven by an external tick.
pub struct Scheduler {
    jobs: RwLock<HashMap<JobId, JobState>>,
    trigger: Arc<dyn StrategyTrigger>,
}

/// Parse a five-field cron expression (minute hour day month weekday).
fn parse_cron(expr: &str) -> Result<Schedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::InvalidCron(format!(
            "expected 5 fields, got {fields}"
        )));
    }
    // The cron crate wants a seconds field; pin it to zero for minute
    // granularity.
    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|err| SchedulerError::InvalidCron(err.to_string()))
}

impl Scheduler {
    pub fn new(trigger: Arc<dyn StrategyTrigger>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            trigger,
        }
    }

    /// Register a job; the first fire is the next matching instant.
    pub fn add_job(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        name: &str,
        cron_expr: &str,
        context: Value,
    ) -> Result<ScheduledJob, SchedulerError> {
        let schedule = parse_cron(cron_expr)?;
        let job = ScheduledJob {
            id: Uuid::new_v4(),
            user_id,
            strategy_id,
            name: name.to_string(),
            cron_expr: cron_expr.to_string(),
            enabled: true,
            context,
            last_fired_at: None,
            next_fire_at: schedule.after(&Utc::now()).next(),
        };
        self.jobs
            .write()
            .insert(job.id, JobState { job: job.clone(), schedule });
        Ok(job)
    }

    pub fn remove_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.jobs
            .write()
            .remove(&job_id)
            .map(|_| ())
            .ok_or(SchedulerError::NotFound)
    }

    pub fn set_enabled(&self, job_id: JobId, enabled: bool) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write();
        let state = jobs.get_mut(&job_id).ok_or(SchedulerError::NotFound)?;
        state.job.enabled = enabled;
        Ok(())
    }

    #[must_use]
    pub fn jobs_for(&self, user_id: UserId) -> Vec<ScheduledJob> {
        self.jobs
            .read()
            .values()
            .filter(|state| state.job.user_id == user_id)
            .map(|state| state.job.clone())
            .collect()
    }

    /// Fire every job whose next fire time has passed. Each due job fires
    /// exactly once regardless of how many instants were missed.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due: Vec<(JobId, UserId, StrategyId, Value)> = {
            let mut jobs = self.jobs.write();
            let mut due = Vec::new();
            for state in jobs.values_mut() {
                if !state.job.enabled {
                    continue;
                }
                let Some(next) = state.job.next_fire_at else {
                    continue;
                };
                if now >= next {
                    state.job.last_fired_at = Some(now);
                    state.job.next_fire_at = state.schedule.after(&now).next();
                    due.push((
                        state.job.id,
                        state.job.user_id,
                        state.job.strategy_id,
                        state.job.context.clone(),
                    ));
                }
            }
            due
        };

        for (job_id, user_id, strategy_id, context) in due {
            info!(job_id = %job_id, strategy_id = %strategy_id, "scheduled job fired");
            if let Err(err) = self.trigger.trigger(user_id, strategy_id, context).await {
                warn!(job_id = %job_id, error = %err, "scheduled trigger failed");
            }
        }
    }

    /// Drive the scheduler on a fixed tick interval until the handle is
    /// dropped or aborted.
    pub fn spawn(self: Arc<Self>, tick_interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                self.tick(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingTrigger {
        fired: Mutex<Vec<(StrategyId, Value)>>,
    }

    impl RecordingTrigger {
        fn new() -> Self {
            Self {
                fired: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StrategyTrigger for RecordingTrigger {
        async fn trigger(
            &self,
            _user_id: UserId,
            strategy_id: StrategyId,
            context: Value,
        ) -> Result<fanout_core::StrategyRunId, String> {
            self.fired.lock().push((strategy_id, context));
            Ok(Uuid::new_v4())
        }
    }

    #[test]
    fn five_field_expressions_are_required() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("0 0 * * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[tokio::test]
    async fn due_job_fires_once_and_reschedules() {
        let trigger = Arc::new(RecordingTrigger::new());
        let scheduler = Scheduler::new(trigger.clone());
        let job = scheduler
            .add_job(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "every-minute",
                "* * * * *",
                serde_json::json!({"lots": 1}),
            )
            .unwrap();

        let fire_at = job.next_fire_at.unwrap();
        scheduler.tick(fire_at).await;
        assert_eq!(trigger.fired.lock().len(), 1);

        // Same instant again: already rescheduled, nothing fires.
        scheduler.tick(fire_at).await;
        assert_eq!(trigger.fired.lock().len(), 1);
    }

    #[tokio::test]
    async fn missed_instants_are_not_replayed() {
        let trigger = Arc::new(RecordingTrigger::new());
        let scheduler = Scheduler::new(trigger.clone());
        let job = scheduler
            .add_job(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "every-minute",
                "* * * * *",
                Value::Null,
            )
            .unwrap();

        // Pretend the process slept through five instants.
        let late = job.next_fire_at.unwrap() + chrono::Duration::minutes(5);
        scheduler.tick(late).await;
        assert_eq!(trigger.fired.lock().len(), 1, "one fire, not six");

        let rescheduled = scheduler.jobs_for(job.user_id)[0].next_fire_at.unwrap();
        assert!(rescheduled > late);
    }

    #[tokio::test]
    async fn disabled_jobs_do_not_fire() {
        let trigger = Arc::new(RecordingTrigger::new());
        let scheduler = Scheduler::new(trigger.clone());
        let job = scheduler
            .add_job(Uuid::new_v4(), Uuid::new_v4(), "paused", "* * * * *", Value::Null)
            .unwrap();
        scheduler.set_enabled(job.id, false).unwrap();

        let fire_at = job.next_fire_at.unwrap();
        scheduler.tick(fire_at).await;
        assert!(trigger.fired.lock().is_empty());
    }
}
