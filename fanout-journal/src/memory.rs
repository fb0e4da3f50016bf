//! In-memory journal used by unit tests and backtests.

use std::collections::HashMap;

use parking_lot::Mutex;

use fanout_core::{ExecutionEvent, ExecutionRun, GroupId, RunId, UserId};

use crate::{Journal, JournalError, JournalResult, NewEvent};

/// Non-durable [`Journal`] with the same semantics as the SQLite backend.
#[derive(Default)]
pub struct MemoryJournal {
    runs: Mutex<HashMap<RunId, ExecutionRun>>,
    events: Mutex<HashMap<RunId, Vec<ExecutionEvent>>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn insert_run(&self, run: &ExecutionRun) -> JournalResult<()> {
        self.runs.lock().insert(run.id, run.clone());
        Ok(())
    }

    fn update_run(&self, run: &ExecutionRun) -> JournalResult<()> {
        let mut runs = self.runs.lock();
        let stored = runs.get(&run.id).ok_or(JournalError::NotFound(run.id))?;
        if stored.status.is_terminal() {
            return Err(JournalError::Immutable(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    fn run(&self, run_id: RunId) -> JournalResult<Option<ExecutionRun>> {
        Ok(self.runs.lock().get(&run_id).cloned())
    }

    fn runs_for_group(&self, group_id: GroupId) -> JournalResult<Vec<ExecutionRun>> {
        let mut runs: Vec<ExecutionRun> = self
            .runs
            .lock()
            .values()
            .filter(|run| run.group_id == Some(group_id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(runs)
    }

    fn runs_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionRun>> {
        let mut runs: Vec<ExecutionRun> = self
            .runs
            .lock()
            .values()
            .filter(|run| run.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(runs)
    }

    fn append_event(&self, run_id: RunId, event: NewEvent) -> JournalResult<ExecutionEvent> {
        let mut events = self.events.lock();
        let bucket = events.entry(run_id).or_default();
        let seq = bucket.len() as u64 + 1;
        let event = ExecutionEvent {
            run_id,
            seq,
            account_id: event.account_id,
            order_id: event.order_id,
            status: event.status,
            requested_at: event.requested_at,
            completed_at: event.completed_at,
            latency_ms: event.latency_ms,
            message: event.message,
            metadata: event.metadata,
        };
        bucket.push(event.clone());
        Ok(event)
    }

    fn events(&self, run_id: RunId) -> JournalResult<Vec<ExecutionEvent>> {
        Ok(self.events.lock().get(&run_id).cloned().unwrap_or_default())
    }

    fn events_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionEvent>> {
        let runs = self.runs.lock();
        let run_ids: Vec<RunId> = runs
            .values()
            .filter(|run| run.user_id == user_id)
            .map(|run| run.id)
            .collect();
        drop(runs);
        let events = self.events.lock();
        let mut collected: Vec<ExecutionEvent> = run_ids
            .iter()
            .filter_map(|id| events.get(id))
            .flatten()
            .cloned()
            .collect();
        collected.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.seq.cmp(&b.seq)));
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fanout_core::{LegStatus, RunStatus};
    use uuid::Uuid;

    #[test]
    fn memory_journal_matches_store_contract() {
        let journal = MemoryJournal::new();
        let mut run = ExecutionRun {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            group_id: None,
            strategy_run_id: None,
            status: RunStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            payload: serde_json::Value::Null,
            latency: None,
        };
        journal.insert_run(&run).unwrap();
        let first = journal
            .append_event(run.id, NewEvent::status_only(LegStatus::Requested))
            .unwrap();
        assert_eq!(first.seq, 1);

        run.status = RunStatus::Failed;
        journal.update_run(&run).unwrap();
        assert!(matches!(
            journal.update_run(&run),
            Err(JournalError::Immutable(_))
        ));
    }
}
