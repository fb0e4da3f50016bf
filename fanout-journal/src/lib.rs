//! Persistence for execution runs and their per-leg telemetry events.
//!
//! Events are append-only and totally ordered per run by `seq`. Runs become
//! immutable once terminal; the store refuses later writes. The SQLite
//! backend survives process restarts; the in-memory backend backs tests.

use chrono::{DateTime, Utc};
use serde_json::Value;

use fanout_core::{
    ExecutionEvent, ExecutionRun, GroupId, LegStatus, OrderId, RunId, RunStatus, UserId,
};

mod memory;
mod sqlite;

pub use memory::MemoryJournal;
pub use sqlite::SqliteJournal;

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Failures surfaced by the journal backends.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("execution run {0} not found")]
    NotFound(RunId),
    #[error("execution run {0} is terminal and immutable")]
    Immutable(RunId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Event payload before the journal assigns its sequence number.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub account_id: Option<fanout_core::AccountId>,
    pub order_id: Option<OrderId>,
    pub status: LegStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
    pub metadata: Value,
}

impl NewEvent {
    /// Minimal event with just a status and request timestamp.
    #[must_use]
    pub fn status_only(status: LegStatus) -> Self {
        Self {
            account_id: None,
            order_id: None,
            status,
            requested_at: Utc::now(),
            completed_at: None,
            latency_ms: None,
            message: None,
            metadata: Value::Null,
        }
    }
}

/// Storage contract shared by the SQLite and in-memory backends.
pub trait Journal: Send + Sync {
    /// Insert a freshly created run.
    fn insert_run(&self, run: &ExecutionRun) -> JournalResult<()>;

    /// Overwrite a run's mutable fields. Fails with [`JournalError::Immutable`]
    /// when the stored run already reached a terminal status.
    fn update_run(&self, run: &ExecutionRun) -> JournalResult<()>;

    fn run(&self, run_id: RunId) -> JournalResult<Option<ExecutionRun>>;

    fn runs_for_group(&self, group_id: GroupId) -> JournalResult<Vec<ExecutionRun>>;

    fn runs_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionRun>>;

    /// Append one event, assigning the next sequence number for the run.
    fn append_event(&self, run_id: RunId, event: NewEvent) -> JournalResult<ExecutionEvent>;

    /// Events for a run in sequence order.
    fn events(&self, run_id: RunId) -> JournalResult<Vec<ExecutionEvent>>;

    /// Every event across a user's runs (analytics input).
    fn events_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionEvent>>;
}

pub(crate) fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Partial => "partial",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::RolledBack => "rolled_back",
    }
}

pub(crate) fn run_status_parse(raw: &str) -> JournalResult<RunStatus> {
    match raw {
        "pending" => Ok(RunStatus::Pending),
        "partial" => Ok(RunStatus::Partial),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        "rolled_back" => Ok(RunStatus::RolledBack),
        other => Err(JournalError::Corrupt(format!("run status '{other}'"))),
    }
}

pub(crate) fn leg_status_str(status: LegStatus) -> &'static str {
    match status {
        LegStatus::Requested => "requested",
        LegStatus::Accepted => "accepted",
        LegStatus::Rejected => "rejected",
        LegStatus::Filled => "filled",
        LegStatus::Cancelled => "cancelled",
        LegStatus::CancelledBeforeSend => "cancelled_before_send",
        LegStatus::Error => "error",
    }
}

pub(crate) fn leg_status_parse(raw: &str) -> JournalResult<LegStatus> {
    match raw {
        "requested" => Ok(LegStatus::Requested),
        "accepted" => Ok(LegStatus::Accepted),
        "rejected" => Ok(LegStatus::Rejected),
        "filled" => Ok(LegStatus::Filled),
        "cancelled" => Ok(LegStatus::Cancelled),
        "cancelled_before_send" => Ok(LegStatus::CancelledBeforeSend),
        "error" => Ok(LegStatus::Error),
        other => Err(JournalError::Corrupt(format!("leg status '{other}'"))),
    }
}
