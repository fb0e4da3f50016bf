//! SQLite-backed journal. One connection per call, WAL mode, schema applied
//! on connect.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use fanout_core::{ExecutionEvent, ExecutionRun, GroupId, LatencySummary, RunId, UserId};

use crate::{
    leg_status_parse, leg_status_str, run_status_parse, run_status_str, Journal, JournalError,
    JournalResult, NewEvent,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS execution_runs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    group_id TEXT,
    strategy_run_id TEXT,
    status TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    completed_at TEXT,
    payload TEXT NOT NULL,
    latency TEXT
);
CREATE TABLE IF NOT EXISTS execution_events (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    account_id TEXT,
    order_id TEXT,
    status TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    completed_at TEXT,
    latency_ms REAL,
    message TEXT,
    metadata TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_runs_group ON execution_runs (group_id);
CREATE INDEX IF NOT EXISTS idx_runs_user ON execution_runs (user_id);
"#;

/// Journal stored in a single SQLite database file.
#[derive(Clone)]
pub struct SqliteJournal {
    path: PathBuf,
}

impl SqliteJournal {
    /// Open (or create) the journal database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> JournalResult<Self> {
        let journal = Self { path: path.into() };
        journal.connect()?;
        Ok(journal)
    }

    fn connect(&self) -> JournalResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| JournalError::Storage(err.to_string()))?;
            }
        }
        let conn =
            Connection::open(&self.path).map_err(|err| JournalError::Storage(err.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(|err| JournalError::Storage(err.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| JournalError::Storage(err.to_string()))?;
        Ok(conn)
    }
}

fn storage(err: rusqlite::Error) -> JournalError {
    JournalError::Storage(err.to_string())
}

fn parse_uuid(raw: &str) -> JournalResult<Uuid> {
    raw.parse()
        .map_err(|_| JournalError::Corrupt(format!("uuid '{raw}'")))
}

fn parse_ts(raw: &str) -> JournalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| JournalError::Corrupt(format!("timestamp '{raw}'")))
}

fn parse_json(raw: Option<String>) -> JournalResult<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => {
            serde_json::from_str(&text).map_err(|err| JournalError::Corrupt(err.to_string()))
        }
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        user_id: row.get(1)?,
        group_id: row.get(2)?,
        strategy_run_id: row.get(3)?,
        status: row.get(4)?,
        requested_at: row.get(5)?,
        completed_at: row.get(6)?,
        payload: row.get(7)?,
        latency: row.get(8)?,
    })
}

struct RawRun {
    id: String,
    user_id: String,
    group_id: Option<String>,
    strategy_run_id: Option<String>,
    status: String,
    requested_at: String,
    completed_at: Option<String>,
    payload: String,
    latency: Option<String>,
}

impl RawRun {
    fn decode(self) -> JournalResult<ExecutionRun> {
        let latency: Option<LatencySummary> = match self.latency {
            None => None,
            Some(text) => Some(
                serde_json::from_str(&text).map_err(|err| JournalError::Corrupt(err.to_string()))?,
            ),
        };
        Ok(ExecutionRun {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            group_id: self.group_id.as_deref().map(parse_uuid).transpose()?,
            strategy_run_id: self.strategy_run_id.as_deref().map(parse_uuid).transpose()?,
            status: run_status_parse(&self.status)?,
            requested_at: parse_ts(&self.requested_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            payload: parse_json(Some(self.payload))?,
            latency,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, user_id, group_id, strategy_run_id, status, requested_at, completed_at, payload, latency";

impl Journal for SqliteJournal {
    fn insert_run(&self, run: &ExecutionRun) -> JournalResult<()> {
        let conn = self.connect()?;
        let payload =
            serde_json::to_string(&run.payload).map_err(|err| JournalError::Storage(err.to_string()))?;
        let latency = run
            .latency
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| JournalError::Storage(err.to_string()))?;
        conn.execute(
            &format!("INSERT INTO execution_runs ({RUN_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![
                run.id.to_string(),
                run.user_id.to_string(),
                run.group_id.map(|id| id.to_string()),
                run.strategy_run_id.map(|id| id.to_string()),
                run_status_str(run.status),
                run.requested_at.to_rfc3339(),
                run.completed_at.map(|ts| ts.to_rfc3339()),
                payload,
                latency,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn update_run(&self, run: &ExecutionRun) -> JournalResult<()> {
        let conn = self.connect()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT status FROM execution_runs WHERE id = ?1",
                params![run.id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let stored = stored.ok_or(JournalError::NotFound(run.id))?;
        if run_status_parse(&stored)?.is_terminal() {
            return Err(JournalError::Immutable(run.id));
        }
        let payload =
            serde_json::to_string(&run.payload).map_err(|err| JournalError::Storage(err.to_string()))?;
        let latency = run
            .latency
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| JournalError::Storage(err.to_string()))?;
        conn.execute(
            "UPDATE execution_runs
             SET status = ?2, completed_at = ?3, payload = ?4, latency = ?5
             WHERE id = ?1",
            params![
                run.id.to_string(),
                run_status_str(run.status),
                run.completed_at.map(|ts| ts.to_rfc3339()),
                payload,
                latency,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn run(&self, run_id: RunId) -> JournalResult<Option<ExecutionRun>> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE id = ?1"),
                params![run_id.to_string()],
                row_to_run,
            )
            .optional()
            .map_err(storage)?;
        raw.map(RawRun::decode).transpose()
    }

    fn runs_for_group(&self, group_id: GroupId) -> JournalResult<Vec<ExecutionRun>> {
        self.select_runs(
            &format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE group_id = ?1 ORDER BY requested_at DESC"),
            group_id.to_string(),
        )
    }

    fn runs_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionRun>> {
        self.select_runs(
            &format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE user_id = ?1 ORDER BY requested_at DESC"),
            user_id.to_string(),
        )
    }

    fn append_event(&self, run_id: RunId, event: NewEvent) -> JournalResult<ExecutionEvent> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(storage)?;
        let seq: u64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM execution_events WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|err| JournalError::Storage(err.to_string()))?;
        tx.execute(
            "INSERT INTO execution_events
             (run_id, seq, account_id, order_id, status, requested_at, completed_at, latency_ms, message, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                run_id.to_string(),
                seq,
                event.account_id.map(|id| id.to_string()),
                event.order_id.map(|id| id.to_string()),
                leg_status_str(event.status),
                event.requested_at.to_rfc3339(),
                event.completed_at.map(|ts| ts.to_rfc3339()),
                event.latency_ms,
                event.message,
                metadata,
            ],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(ExecutionEvent {
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
        })
    }

    fn events(&self, run_id: RunId) -> JournalResult<Vec<ExecutionEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, seq, account_id, order_id, status, requested_at, completed_at,
                        latency_ms, message, metadata
                 FROM execution_events WHERE run_id = ?1 ORDER BY seq ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![run_id.to_string()], row_to_event)
            .map_err(storage)?;
        decode_events(rows)
    }

    fn events_for_user(&self, user_id: UserId) -> JournalResult<Vec<ExecutionEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT e.run_id, e.seq, e.account_id, e.order_id, e.status, e.requested_at,
                        e.completed_at, e.latency_ms, e.message, e.metadata
                 FROM execution_events e
                 JOIN execution_runs r ON r.id = e.run_id
                 WHERE r.user_id = ?1
                 ORDER BY e.requested_at ASC, e.seq ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_event)
            .map_err(storage)?;
        decode_events(rows)
    }
}

impl SqliteJournal {
    fn select_runs(&self, sql: &str, key: String) -> JournalResult<Vec<ExecutionRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql).map_err(storage)?;
        let rows = stmt.query_map(params![key], row_to_run).map_err(storage)?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(raw.map_err(storage)?.decode()?);
        }
        Ok(runs)
    }
}

struct RawEvent {
    run_id: String,
    seq: u64,
    account_id: Option<String>,
    order_id: Option<String>,
    status: String,
    requested_at: String,
    completed_at: Option<String>,
    latency_ms: Option<f64>,
    message: Option<String>,
    metadata: String,
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        account_id: row.get(2)?,
        order_id: row.get(3)?,
        status: row.get(4)?,
        requested_at: row.get(5)?,
        completed_at: row.get(6)?,
        latency_ms: row.get(7)?,
        message: row.get(8)?,
        metadata: row.get(9)?,
    })
}

fn decode_events(
    rows: impl Iterator<Item = rusqlite::Result<RawEvent>>,
) -> JournalResult<Vec<ExecutionEvent>> {
    let mut events = Vec::new();
    for raw in rows {
        let raw = raw.map_err(storage)?;
        events.push(ExecutionEvent {
            run_id: parse_uuid(&raw.run_id)?,
            seq: raw.seq,
            account_id: raw.account_id.as_deref().map(parse_uuid).transpose()?,
            order_id: raw.order_id.as_deref().map(parse_uuid).transpose()?,
            status: leg_status_parse(&raw.status)?,
            requested_at: parse_ts(&raw.requested_at)?,
            completed_at: raw.completed_at.as_deref().map(parse_ts).transpose()?,
            latency_ms: raw.latency_ms,
            message: raw.message,
            metadata: parse_json(Some(raw.metadata))?,
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::{LegStatus, RunStatus};
    use serde_json::json;

    fn sample_run() -> ExecutionRun {
        ExecutionRun {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            group_id: Some(Uuid::new_v4()),
            strategy_run_id: None,
            status: RunStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            payload: json!({"symbol": "NIFTY", "lots": 10}),
            latency: None,
        }
    }

    #[test]
    fn run_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let run = sample_run();
        {
            let journal = SqliteJournal::new(&path).unwrap();
            journal.insert_run(&run).unwrap();
        }
        let reopened = SqliteJournal::new(&path).unwrap();
        let loaded = reopened.run(run.id).unwrap().expect("run persisted");
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.payload["symbol"], "NIFTY");
    }

    #[test]
    fn event_sequence_is_monotonic_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SqliteJournal::new(dir.path().join("journal.db")).unwrap();
        let run = sample_run();
        journal.insert_run(&run).unwrap();

        let other = sample_run();
        journal.insert_run(&other).unwrap();

        for expected in 1..=3u64 {
            let event = journal
                .append_event(run.id, NewEvent::status_only(LegStatus::Requested))
                .unwrap();
            assert_eq!(event.seq, expected);
        }
        // Sequences are per run, not global.
        let event = journal
            .append_event(other.id, NewEvent::status_only(LegStatus::Accepted))
            .unwrap();
        assert_eq!(event.seq, 1);
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SqliteJournal::new(dir.path().join("journal.db")).unwrap();
        let mut run = sample_run();
        journal.insert_run(&run).unwrap();

        run.status = RunStatus::Succeeded;
        run.completed_at = Some(Utc::now());
        journal.update_run(&run).unwrap();

        run.status = RunStatus::Failed;
        let err = journal.update_run(&run).unwrap_err();
        assert!(matches!(err, JournalError::Immutable(_)));
    }

    #[test]
    fn events_for_user_joins_through_runs() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SqliteJournal::new(dir.path().join("journal.db")).unwrap();
        let run = sample_run();
        journal.insert_run(&run).unwrap();
        journal
            .append_event(run.id, NewEvent::status_only(LegStatus::Accepted))
            .unwrap();

        let events = journal.events_for_user(run.user_id).unwrap();
        assert_eq!(events.len(), 1);
        assert!(journal.events_for_user(Uuid::new_v4()).unwrap().is_empty());
    }
}
