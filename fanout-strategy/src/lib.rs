//! Strategy definitions and the runner that binds a strategy run to its
//! execution runs.
//!
//! All three modes travel the same path: paper and live dispatch through
//! the execution backend (paper differs only in which broker serves the
//! group), while backtest simulates the entry/exit pair and journals
//! synthetic events tagged `simulated` instead of touching any broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use fanout_core::{
    GroupId, LegStatus, OrderType, RunId, RunStatus, Side, StrategyId, StrategyRunId, TradeIntent,
    UserId,
};
use fanout_journal::{Journal, NewEvent};

/// Result alias for strategy operations.
pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("strategy not found")]
    NotFound,
    #[error("strategy is stopped")]
    Stopped,
    #[error("invalid strategy parameters: {0}")]
    InvalidParams(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("journal error: {0}")]
    Journal(String),
}

/// Origin of a strategy definition.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BuiltIn,
    Custom,
    Connector,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Active,
    Stopped,
}

/// Execution environment for one strategy run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    Backtest,
    Paper,
    Live,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// A stored strategy definition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategySpec {
    pub id: StrategyId,
    pub user_id: UserId,
    pub name: String,
    pub kind: StrategyKind,
    pub params: Value,
    pub status: StrategyStatus,
    pub created_at: DateTime<Utc>,
}

/// Log line captured during a strategy run.
#[derive(Clone, Debug, Serialize)]
pub struct RunLog {
    pub level: String,
    pub message: String,
    pub context: Value,
    pub at: DateTime<Utc>,
}

/// One execution of a strategy in a given mode.
#[derive(Clone, Debug, Serialize)]
pub struct StrategyRun {
    pub id: StrategyRunId,
    pub strategy_id: StrategyId,
    pub mode: StrategyMode,
    pub status: StrategyRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_metrics: Value,
    pub execution_run_ids: Vec<RunId>,
    pub logs: Vec<RunLog>,
}

/// What the execution layer reports back for one dispatched group order.
#[derive(Clone, Debug)]
pub struct ExecutionSummary {
    pub execution_run_id: RunId,
    pub order_count: usize,
    pub total_lots: u32,
    pub avg_latency_ms: Option<f64>,
    pub leg_status_counts: BTreeMap<String, usize>,
}

/// Seam to the orchestrator; paper and live runs go through here.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run_group_order(
        &self,
        user_id: UserId,
        group_id: GroupId,
        intent: TradeIntent,
        strategy_id: StrategyId,
        strategy_run_id: StrategyRunId,
    ) -> StrategyResult<ExecutionSummary>;
}

/// Consecutive-failure guard: a strategy that fails too often inside the
/// window is stopped.
#[derive(Clone, Copy, Debug)]
pub struct FailurePolicy {
    pub max_failures: u32,
    pub window: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window: Duration::minutes(10),
        }
    }
}

/// Registry of strategies plus the runner.
pub struct StrategyEngine {
    backend: Arc<dyn ExecutionBackend>,
    journal: Arc<dyn Journal>,
    failure_policy: FailurePolicy,
    strategies: RwLock<HashMap<StrategyId, StrategySpec>>,
    runs: RwLock<HashMap<StrategyRunId, StrategyRun>>,
    failures: Mutex<HashMap<StrategyId, Vec<DateTime<Utc>>>>,
}

impl StrategyEngine {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        journal: Arc<dyn Journal>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            backend,
            journal,
            failure_policy,
            strategies: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        user_id: UserId,
        name: &str,
        kind: StrategyKind,
        params: Value,
    ) -> StrategySpec {
        let spec = StrategySpec {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            kind,
            params,
            status: StrategyStatus::Active,
            created_at: Utc::now(),
        };
        self.strategies.write().insert(spec.id, spec.clone());
        spec
    }

    pub fn get(&self, strategy_id: StrategyId) -> StrategyResult<StrategySpec> {
        self.strategies
            .read()
            .get(&strategy_id)
            .cloned()
            .ok_or(StrategyError::NotFound)
    }

    #[must_use]
    pub fn list_for(&self, user_id: UserId) -> Vec<StrategySpec> {
        let mut specs: Vec<StrategySpec> = self
            .strategies
            .read()
            .values()
            .filter(|spec| spec.user_id == user_id)
            .cloned()
            .collect();
        specs.sort_by_key(|spec| spec.created_at);
        specs
    }

    pub fn set_status(&self, strategy_id: StrategyId, status: StrategyStatus) -> StrategyResult<()> {
        let mut strategies = self.strategies.write();
        let spec = strategies
            .get_mut(&strategy_id)
            .ok_or(StrategyError::NotFound)?;
        spec.status = status;
        Ok(())
    }

    #[must_use]
    pub fn runs_for(&self, strategy_id: StrategyId) -> Vec<StrategyRun> {
        let mut runs: Vec<StrategyRun> = self
            .runs
            .read()
            .values()
            .filter(|run| run.strategy_id == strategy_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.started_at);
        runs
    }

    #[must_use]
    pub fn run_record(&self, run_id: StrategyRunId) -> Option<StrategyRun> {
        self.runs.read().get(&run_id).cloned()
    }

    /// Cumulative PnL and trade count across a strategy's runs.
    #[must_use]
    pub fn performance(&self, strategy_id: StrategyId) -> (Decimal, usize) {
        let runs = self.runs_for(strategy_id);
        let mut pnl = Decimal::ZERO;
        let mut orders = 0usize;
        for run in runs {
            if let Some(value) = run.result_metrics.get("pnl").and_then(Value::as_f64) {
                pnl += Decimal::from_f64(value).unwrap_or(Decimal::ZERO);
            }
            if let Some(count) = run.result_metrics.get("orders").and_then(Value::as_u64) {
                orders += count as usize;
            }
        }
        (pnl, orders)
    }

    /// Execute one run of a strategy. `overrides` merges over the stored
    /// params (webhook payloads and scheduler contexts come through here).
    pub async fn run(
        &self,
        strategy_id: StrategyId,
        mode: StrategyMode,
        overrides: Option<Value>,
    ) -> StrategyResult<StrategyRun> {
        let spec = self.get(strategy_id)?;
        if spec.status == StrategyStatus::Stopped {
            return Err(StrategyError::Stopped);
        }
        let params = merge_params(&spec.params, overrides.as_ref());
        let run_id = Uuid::new_v4();
        let mut run = StrategyRun {
            id: run_id,
            strategy_id,
            mode,
            status: StrategyRunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result_metrics: Value::Null,
            execution_run_ids: Vec::new(),
            logs: Vec::new(),
        };
        self.runs.write().insert(run_id, run.clone());
        info!(strategy_id = %strategy_id, run_id = %run_id, mode = ?mode, "strategy run started");

        let outcome = match mode {
            StrategyMode::Paper | StrategyMode::Live => {
                self.dispatch_live_or_paper(&spec, run_id, &params).await
            }
            StrategyMode::Backtest => self.simulate_backtest(&spec, run_id, &params),
        };

        match outcome {
            Ok((metrics, execution_run_ids, logs)) => {
                run.status = StrategyRunStatus::Succeeded;
                run.result_metrics = metrics;
                run.execution_run_ids = execution_run_ids;
                run.logs = logs;
            }
            Err(err) => {
                run.status = StrategyRunStatus::Failed;
                run.result_metrics = json!({ "error": err.to_string() });
                run.logs.push(RunLog {
                    level: "error".into(),
                    message: err.to_string(),
                    context: Value::Null,
                    at: Utc::now(),
                });
                self.note_failure(strategy_id);
            }
        }
        run.finished_at = Some(Utc::now());
        self.runs.write().insert(run_id, run.clone());

        if run.status == StrategyRunStatus::Failed {
            Err(StrategyError::Execution(
                run.result_metrics["error"]
                    .as_str()
                    .unwrap_or("strategy run failed")
                    .to_string(),
            ))
        } else {
            Ok(run)
        }
    }

    async fn dispatch_live_or_paper(
        &self,
        spec: &StrategySpec,
        run_id: StrategyRunId,
        params: &Value,
    ) -> StrategyResult<(Value, Vec<RunId>, Vec<RunLog>)> {
        let group_id = param_uuid(params, &["execution_group_id", "group_id"])
            .ok_or_else(|| StrategyError::InvalidParams("execution_group_id is required".into()))?;
        let intent = intent_from_params(params)?;

        let summary = self
            .backend
            .run_group_order(spec.user_id, group_id, intent.clone(), spec.id, run_id)
            .await?;

        let metrics = json!({
            "pnl": 0.0,
            "orders": summary.order_count,
            "total_lots": summary.total_lots,
            "avg_latency_ms": summary.avg_latency_ms,
            "leg_status_counts": summary.leg_status_counts,
            "execution_run_ids": [summary.execution_run_id],
        });
        let logs = vec![RunLog {
            level: "info".into(),
            message: "execution dispatched".into(),
            context: json!({
                "execution_run_id": summary.execution_run_id,
                "orders": summary.order_count,
                "symbol": intent.symbol,
                "lots": intent.total_lots,
            }),
            at: Utc::now(),
        }];
        Ok((metrics, vec![summary.execution_run_id], logs))
    }

    /// Deterministic entry/exit simulation; journals a synthetic run whose
    /// events carry a `simulated` tag.
    fn simulate_backtest(
        &self,
        spec: &StrategySpec,
        run_id: StrategyRunId,
        params: &Value,
    ) -> StrategyResult<(Value, Vec<RunId>, Vec<RunLog>)> {
        let entry = param_decimal(params, &["entry_price", "entryPrice"])
            .ok_or_else(|| StrategyError::InvalidParams("entry_price is required".into()))?;
        let exit = param_decimal(params, &["exit_price", "exitPrice"])
            .ok_or_else(|| StrategyError::InvalidParams("exit_price is required".into()))?;
        let lots = param_u32(params, &["lots", "total_lots"])
            .ok_or_else(|| StrategyError::InvalidParams("lots is required".into()))?;
        let lot_size = param_u32(params, &["lot_size", "lotSize"]).unwrap_or(1);
        let side = param_side(params).unwrap_or(Side::Buy);
        let symbol = params
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();

        let quantity = Decimal::from(lots) * Decimal::from(lot_size);
        let per_unit = match side {
            Side::Buy => exit - entry,
            Side::Sell => entry - exit,
        };
        let pnl = per_unit * quantity;

        let synthetic_run_id = Uuid::new_v4();
        let now = Utc::now();
        let synthetic = fanout_core::ExecutionRun {
            id: synthetic_run_id,
            user_id: spec.user_id,
            group_id: None,
            strategy_run_id: Some(run_id),
            status: RunStatus::Pending,
            requested_at: now,
            completed_at: None,
            payload: json!({
                "symbol": symbol,
                "side": side,
                "lots": lots,
                "lot_size": lot_size,
                "simulated": true,
            }),
            latency: None,
        };
        self.journal
            .insert_run(&synthetic)
            .map_err(|err| StrategyError::Journal(err.to_string()))?;
        self.journal
            .append_event(
                synthetic_run_id,
                NewEvent {
                    completed_at: Some(now),
                    latency_ms: Some(0.0),
                    message: Some("simulated fill".into()),
                    metadata: json!({ "simulated": true, "entry": entry, "exit": exit }),
                    ..NewEvent::status_only(LegStatus::Filled)
                },
            )
            .map_err(|err| StrategyError::Journal(err.to_string()))?;
        let mut terminal = synthetic;
        terminal.status = RunStatus::Succeeded;
        terminal.completed_at = Some(Utc::now());
        self.journal
            .update_run(&terminal)
            .map_err(|err| StrategyError::Journal(err.to_string()))?;

        let metrics = json!({
            "pnl": pnl,
            "orders": 1,
            "total_lots": lots,
            "avg_latency_ms": 0.0,
            "execution_run_ids": [synthetic_run_id],
            "entry_price": entry,
            "exit_price": exit,
        });
        let logs = vec![RunLog {
            level: "info".into(),
            message: "backtest simulation completed".into(),
            context: json!({ "pnl": pnl, "quantity": quantity }),
            at: Utc::now(),
        }];
        Ok((metrics, vec![synthetic_run_id], logs))
    }

    fn note_failure(&self, strategy_id: StrategyId) {
        let now = Utc::now();
        let mut failures = self.failures.lock();
        let entry = failures.entry(strategy_id).or_default();
        entry.push(now);
        entry.retain(|at| now - *at <= self.failure_policy.window);
        if entry.len() as u32 >= self.failure_policy.max_failures {
            warn!(strategy_id = %strategy_id, failures = entry.len(), "failure threshold reached; stopping strategy");
            if let Some(spec) = self.strategies.write().get_mut(&strategy_id) {
                spec.status = StrategyStatus::Stopped;
            }
            entry.clear();
        }
    }
}

fn merge_params(base: &Value, overrides: Option<&Value>) -> Value {
    let mut merged = base.clone();
    if let (Some(Value::Object(extra)), Value::Object(target)) = (overrides, &mut merged) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
        return merged;
    }
    if let Some(overrides) = overrides {
        if !overrides.is_null() && !merged.is_object() {
            return overrides.clone();
        }
    }
    merged
}

fn param_value<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| params.get(*key))
}

fn param_uuid(params: &Value, keys: &[&str]) -> Option<Uuid> {
    param_value(params, keys)?.as_str()?.parse().ok()
}

fn param_u32(params: &Value, keys: &[&str]) -> Option<u32> {
    let value = param_value(params, keys)?;
    value
        .as_u64()
        .map(|n| n as u32)
        .or_else(|| value.as_str()?.parse().ok())
}

fn param_decimal(params: &Value, keys: &[&str]) -> Option<Decimal> {
    let value = param_value(params, keys)?;
    match value {
        Value::Number(n) => Decimal::from_f64(n.as_f64()?),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn param_side(params: &Value) -> Option<Side> {
    match param_value(params, &["side"])?.as_str()?.to_uppercase().as_str() {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

/// Build a trade intent from strategy params (live/paper path).
fn intent_from_params(params: &Value) -> StrategyResult<TradeIntent> {
    let symbol = params
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| StrategyError::InvalidParams("symbol is required".into()))?;
    let side =
        param_side(params).ok_or_else(|| StrategyError::InvalidParams("side is required".into()))?;
    let lots = param_u32(params, &["lots", "total_lots"])
        .ok_or_else(|| StrategyError::InvalidParams("lots is required".into()))?;
    let lot_size = param_u32(params, &["lot_size", "lotSize"]).unwrap_or(1);
    let order_type = match param_value(params, &["order_type", "orderType"])
        .and_then(Value::as_str)
        .unwrap_or("MARKET")
        .to_uppercase()
        .as_str()
    {
        "LIMIT" => OrderType::Limit,
        _ => OrderType::Market,
    };
    let intent = TradeIntent {
        symbol: symbol.to_string(),
        side,
        total_lots: lots,
        lot_size,
        order_type,
        price: param_decimal(params, &["price"]),
        take_profit: param_decimal(params, &["take_profit", "takeProfit"]),
        stop_loss: param_decimal(params, &["stop_loss", "stopLoss"]),
        exchange: params
            .get("exchange")
            .and_then(Value::as_str)
            .map(str::to_string),
        symbol_token: None,
    };
    intent
        .validate()
        .map_err(|err| StrategyError::InvalidParams(err.to_string()))?;
    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_journal::MemoryJournal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubBackend {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ExecutionBackend for StubBackend {
        async fn run_group_order(
            &self,
            _user_id: UserId,
            _group_id: GroupId,
            intent: TradeIntent,
            _strategy_id: StrategyId,
            _strategy_run_id: StrategyRunId,
        ) -> StrategyResult<ExecutionSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StrategyError::Execution("broker unavailable".into()));
            }
            let mut counts = BTreeMap::new();
            counts.insert("accepted".to_string(), 2usize);
            Ok(ExecutionSummary {
                execution_run_id: Uuid::new_v4(),
                order_count: 2,
                total_lots: intent.total_lots,
                avg_latency_ms: Some(12.5),
                leg_status_counts: counts,
            })
        }
    }

    fn engine(fail: bool) -> (StrategyEngine, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend::new(fail));
        let journal = Arc::new(MemoryJournal::new());
        (
            StrategyEngine::new(
                backend.clone(),
                journal,
                FailurePolicy {
                    max_failures: 2,
                    window: Duration::minutes(5),
                },
            ),
            backend,
        )
    }

    fn live_params(group_id: GroupId) -> Value {
        json!({
            "execution_group_id": group_id.to_string(),
            "symbol": "NIFTY24AUGFUT",
            "side": "BUY",
            "lots": 6,
            "lot_size": 25,
        })
    }

    #[tokio::test]
    async fn paper_run_records_metrics_and_execution_link() {
        let (engine, backend) = engine(false);
        let user = Uuid::new_v4();
        let spec = engine.create(user, "momentum", StrategyKind::BuiltIn, live_params(Uuid::new_v4()));

        let run = engine.run(spec.id, StrategyMode::Paper, None).await.unwrap();

        assert_eq!(run.status, StrategyRunStatus::Succeeded);
        assert_eq!(run.execution_run_ids.len(), 1);
        assert_eq!(run.result_metrics["orders"], 2);
        assert_eq!(run.result_metrics["total_lots"], 6);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_group_id_is_an_invalid_params_error() {
        let (engine, _) = engine(false);
        let spec = engine.create(
            Uuid::new_v4(),
            "momentum",
            StrategyKind::Custom,
            json!({ "symbol": "NIFTY", "side": "BUY", "lots": 1 }),
        );
        let err = engine.run(spec.id, StrategyMode::Live, None).await.unwrap_err();
        assert!(matches!(err, StrategyError::Execution(_)));
    }

    #[tokio::test]
    async fn repeated_failures_stop_the_strategy() {
        let (engine, _) = engine(true);
        let spec = engine.create(
            Uuid::new_v4(),
            "momentum",
            StrategyKind::BuiltIn,
            live_params(Uuid::new_v4()),
        );

        for _ in 0..2 {
            let _ = engine.run(spec.id, StrategyMode::Live, None).await;
        }
        assert_eq!(engine.get(spec.id).unwrap().status, StrategyStatus::Stopped);
        assert!(matches!(
            engine.run(spec.id, StrategyMode::Live, None).await,
            Err(StrategyError::Stopped)
        ));
    }

    #[tokio::test]
    async fn backtest_journals_simulated_events() {
        let backend = Arc::new(StubBackend::new(false));
        let journal = Arc::new(MemoryJournal::new());
        let engine = StrategyEngine::new(backend, journal.clone(), FailurePolicy::default());
        let user = Uuid::new_v4();
        let spec = engine.create(
            user,
            "momentum",
            StrategyKind::BuiltIn,
            json!({
                "symbol": "NIFTY24AUGFUT",
                "side": "BUY",
                "lots": 2,
                "lot_size": 25,
                "entry_price": 100.0,
                "exit_price": 104.0,
            }),
        );

        let run = engine
            .run(spec.id, StrategyMode::Backtest, None)
            .await
            .unwrap();

        // 4 points * 50 quantity.
        assert_eq!(run.result_metrics["pnl"], json!(Decimal::from(200)));
        let synthetic_id = run.execution_run_ids[0];
        let events = journal.events(synthetic_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata["simulated"], true);
        let stored = journal.run(synthetic_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn overrides_merge_over_stored_params() {
        let (engine, _) = engine(false);
        let spec = engine.create(
            Uuid::new_v4(),
            "momentum",
            StrategyKind::Connector,
            live_params(Uuid::new_v4()),
        );
        let run = engine
            .run(
                spec.id,
                StrategyMode::Paper,
                Some(json!({ "lots": 9 })),
            )
            .await
            .unwrap();
        assert_eq!(run.result_metrics["total_lots"], 9);
    }
}
