//! Per-run state machine: plan, gate, dispatch, finalise.
//!
//! A run moves through Planning -> Gating -> Dispatching -> Finalising and
//! ends Succeeded, Partial, Failed, or RolledBack. The orchestrator owns
//! its dispatched legs: every leg reaches a terminal event before the run
//! record goes terminal, and RMS reservations are always committed or
//! released by the time the run ends.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use fanout_broker::{BrokerError, OrderCommand, PlacementStatus};
use fanout_core::{
    Allocation, AllocationSlice, ExecutionGroup, ExecutionMode, ExecutionRun, LatencySummary,
    LegStatus, Order, OrderState, RunId, RunStatus, StrategyRunId, TradeIntent, UserId,
};
use fanout_journal::{Journal, NewEvent};
use fanout_rms::{LegCheck, Reservation, RmsEngine};

use crate::{
    plan_allocation, AccountGateway, CancelToken, ExecutionConfig, ExecutionError, ExecutionResult,
};

/// Outcome of one finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run: ExecutionRun,
    pub allocation: Allocation,
    pub orders: Vec<Order>,
    /// Final status per allocation slice, in allocation order.
    pub leg_statuses: Vec<LegStatus>,
}

/// Drives execution runs against a gateway, gated by the RMS engine, with
/// every leg outcome journalled.
pub struct Orchestrator {
    gateway: Arc<dyn AccountGateway>,
    rms: Arc<RmsEngine>,
    journal: Arc<dyn Journal>,
    config: ExecutionConfig,
}

struct DispatchLeg {
    index: usize,
    position: usize,
    slice: AllocationSlice,
    command: OrderCommand,
}

struct LegOutcome {
    index: usize,
    status: LegStatus,
    order: Option<Order>,
    latency_ms: Option<f64>,
    journal_failed: bool,
}

#[derive(Clone)]
struct LegContext {
    gateway: Arc<dyn AccountGateway>,
    journal: Arc<dyn Journal>,
    rms: Arc<RmsEngine>,
    reservations: Arc<Mutex<Vec<Option<Reservation>>>>,
    failures: Arc<AtomicU32>,
    cancel: CancelToken,
    run_id: RunId,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn AccountGateway>,
        rms: Arc<RmsEngine>,
        journal: Arc<dyn Journal>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            rms,
            journal,
            config,
        }
    }

    #[must_use]
    pub fn journal(&self) -> Arc<dyn Journal> {
        Arc::clone(&self.journal)
    }

    /// Execute one trade intent against a group. Returns the run report;
    /// planning and validation failures are errors, while per-leg failures
    /// are reflected in the run status.
    pub async fn execute(
        &self,
        user_id: UserId,
        group: &ExecutionGroup,
        intent: &TradeIntent,
        strategy_run_id: Option<StrategyRunId>,
        cancel: CancelToken,
    ) -> ExecutionResult<RunReport> {
        intent.validate()?;

        let run_id = Uuid::new_v4();
        let mut run = ExecutionRun {
            id: run_id,
            user_id,
            group_id: Some(group.id),
            strategy_run_id,
            status: RunStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            payload: intent_payload(intent),
            latency: None,
        };
        self.journal.insert_run(&run)?;
        info!(run_id = %run_id, group_id = %group.id, symbol = %intent.symbol, "execution run created");

        // Planning.
        let allocation = match plan_allocation(group, intent.total_lots) {
            Ok(allocation) => allocation,
            Err(err) => {
                self.journal.append_event(
                    run_id,
                    NewEvent {
                        status: LegStatus::Error,
                        message: Some(err.to_string()),
                        ..NewEvent::status_only(LegStatus::Error)
                    },
                )?;
                run.status = RunStatus::Failed;
                run.completed_at = Some(Utc::now());
                self.journal.update_run(&run)?;
                return Err(err);
            }
        };

        // Gating: RMS pre-trade per leg, broker I/O kept outside the
        // counter lock.
        let leg_count = allocation.slices.len();
        let mut statuses: Vec<Option<LegStatus>> = vec![None; leg_count];
        let reservations: Arc<Mutex<Vec<Option<Reservation>>>> =
            Arc::new(Mutex::new(Vec::with_capacity(leg_count)));
        let mut dispatchable = Vec::new();

        for (index, slice) in allocation.slices.iter().enumerate() {
            let margin = self
                .gateway
                .margin_available(slice.account_id)
                .await
                .unwrap_or(Decimal::ZERO);
            let ref_price = match intent.price {
                Some(price) => price,
                None => self
                    .gateway
                    .reference_price(slice.account_id, &intent.symbol)
                    .await
                    .unwrap_or(Decimal::ZERO),
            };
            let check = LegCheck {
                lots: slice.lots,
                lot_size: intent.lot_size,
                ref_price,
                margin_available: margin,
            };
            match self.rms.pre_trade(user_id, &check) {
                Ok(reservation) => {
                    reservations.lock().push(Some(reservation));
                    let position = dispatchable.len();
                    dispatchable.push(DispatchLeg {
                        index,
                        position,
                        slice: slice.clone(),
                        command: leg_command(intent, slice, run_id),
                    });
                }
                Err(violation) => {
                    reservations.lock().push(None);
                    statuses[index] = Some(LegStatus::Rejected);
                    self.journal.append_event(
                        run_id,
                        NewEvent {
                            account_id: Some(slice.account_id),
                            message: Some(violation.to_string()),
                            metadata: json!({ "rule": violation.rule() }),
                            ..NewEvent::status_only(LegStatus::Rejected)
                        },
                    )?;
                    warn!(
                        run_id = %run_id,
                        account_id = %slice.account_id,
                        rule = violation.rule(),
                        "leg rejected by rms"
                    );
                }
            }
        }

        // Dispatching.
        let ctx = LegContext {
            gateway: Arc::clone(&self.gateway),
            journal: Arc::clone(&self.journal),
            rms: Arc::clone(&self.rms),
            reservations: Arc::clone(&reservations),
            failures: Arc::new(AtomicU32::new(0)),
            cancel,
            run_id,
        };
        let mut orders = Vec::new();
        let mut latencies = Vec::new();
        let mut rolled_back = false;
        let mut journal_failed = false;
        let mut rollback_record = Value::Null;

        if !dispatchable.is_empty() {
            let outcomes = match group.mode {
                ExecutionMode::Parallel => {
                    self.dispatch_concurrent(&ctx, dispatchable, None).await
                }
                ExecutionMode::Staggered => {
                    self.dispatch_concurrent(&ctx, dispatchable, Some(self.config.stagger_delay))
                        .await
                }
                ExecutionMode::Sync => self.dispatch_sync(&ctx, dispatchable).await,
            };

            for outcome in outcomes {
                statuses[outcome.index] = Some(outcome.status);
                journal_failed |= outcome.journal_failed;
                if let Some(latency) = outcome.latency_ms {
                    latencies.push(latency);
                }
                if let Some(order) = outcome.order {
                    orders.push((outcome.index, order, outcome.latency_ms));
                }
            }

            // Sync-mode rollback of successful legs, only when configured.
            if group.mode == ExecutionMode::Sync && self.config.rollback_on_partial {
                let successes: Vec<usize> = statuses
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_some_and(|s| s.is_success()))
                    .map(|(i, _)| i)
                    .collect();
                let failures = statuses
                    .iter()
                    .flatten()
                    .filter(|s| s.is_terminal() && !s.is_success())
                    .count();
                if !successes.is_empty() && failures > 0 {
                    rollback_record = self
                        .roll_back(&ctx, &orders, self.config.run_deadline_parallel)
                        .await;
                    rolled_back = true;
                }
            }
        }

        // Any leg that never got an outcome (run deadline) is an error leg;
        // its reservation is handed back here.
        for (index, slot) in statuses.iter_mut().enumerate() {
            if slot.is_none() {
                if let Some(reservation) = reservations.lock()[index].take() {
                    self.rms.release(reservation);
                }
                let _ = self.journal.append_event(
                    run_id,
                    NewEvent {
                        account_id: Some(allocation.slices[index].account_id),
                        message: Some("run deadline exceeded".into()),
                        ..NewEvent::status_only(LegStatus::Error)
                    },
                );
                *slot = Some(LegStatus::Error);
            }
        }

        // Finalising.
        let leg_statuses: Vec<LegStatus> = statuses.into_iter().flatten().collect();
        let success_count = leg_statuses.iter().filter(|s| s.is_success()).count();
        let failure_count = leg_statuses.len() - success_count;

        run.status = if journal_failed {
            RunStatus::Failed
        } else if rolled_back {
            RunStatus::RolledBack
        } else if success_count == 0 {
            RunStatus::Failed
        } else if failure_count > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        };
        run.completed_at = Some(Utc::now());

        run.latency = LatencySummary::from_samples(&latencies);
        run.payload = finalize_payload(intent, &allocation, &orders, &run.latency, rollback_record);
        self.journal.update_run(&run)?;

        info!(
            run_id = %run_id,
            status = ?run.status,
            successes = success_count,
            failures = failure_count,
            "execution run finalised"
        );

        if journal_failed {
            error!(run_id = %run_id, "leg telemetry write failed; run marked failed");
            return Err(ExecutionError::Internal(
                "event journal write failed during dispatch".into(),
            ));
        }

        Ok(RunReport {
            run,
            allocation,
            orders: orders.into_iter().map(|(_, order, _)| order).collect(),
            leg_statuses,
        })
    }

    /// Parallel / staggered dispatch through a bounded worker pool.
    async fn dispatch_concurrent(
        &self,
        ctx: &LegContext,
        legs: Vec<DispatchLeg>,
        stagger: Option<Duration>,
    ) -> Vec<LegOutcome> {
        let deadline = Instant::now()
            + match stagger {
                Some(_) => self.config.run_deadline_staggered,
                None => self.config.run_deadline_parallel,
            };
        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool.max(1)));
        let threshold = self.config.stagger_abort_threshold;
        let mut set = JoinSet::new();

        for leg in legs {
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                if let Some(delay) = stagger {
                    sleep(delay * leg.position as u32).await;
                    if let Some(limit) = threshold {
                        if ctx.failures.load(Ordering::SeqCst) >= limit {
                            return skip_leg(&ctx, &leg, "earlier legs breached failure threshold");
                        }
                    }
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return skip_leg(&ctx, &leg, "worker pool closed");
                };
                if ctx.cancel.is_cancelled() {
                    return skip_leg(&ctx, &leg, "run cancelled");
                }
                dispatch_one(&ctx, &leg).await
            });
        }

        let mut outcomes = Vec::new();
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(outcome))) => outcomes.push(outcome),
                Ok(Some(Err(join_err))) => {
                    error!(error = %join_err, "leg task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(run_id = %ctx.run_id, "run deadline elapsed; aborting pending legs");
                    set.abort_all();
                    break;
                }
            }
        }
        outcomes
    }

    /// Strict-order dispatch; the first failed leg cancels the remainder.
    async fn dispatch_sync(&self, ctx: &LegContext, legs: Vec<DispatchLeg>) -> Vec<LegOutcome> {
        let mut outcomes = Vec::new();
        let aborted = AtomicBool::new(false);
        for leg in legs {
            if aborted.load(Ordering::SeqCst) {
                outcomes.push(skip_leg(ctx, &leg, "earlier leg failed"));
                continue;
            }
            if ctx.cancel.is_cancelled() {
                outcomes.push(skip_leg(ctx, &leg, "run cancelled"));
                continue;
            }
            let outcome = dispatch_one(ctx, &leg).await;
            if !outcome.status.is_success() {
                aborted.store(true, Ordering::SeqCst);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Best-effort cancel of already-successful legs, bounded by the run
    /// deadline. Recorded in the run payload rather than as extra leg
    /// events so each dispatched leg keeps exactly one terminal event.
    async fn roll_back(
        &self,
        ctx: &LegContext,
        orders: &[(usize, Order, Option<f64>)],
        deadline: Duration,
    ) -> Value {
        let mut entries = Vec::new();
        let work = async {
            for (_, order, _) in orders {
                let Some(broker_order_id) = order.broker_order_id.as_deref() else {
                    continue;
                };
                let cancelled = ctx
                    .gateway
                    .cancel(order.account_id, broker_order_id)
                    .await
                    .is_ok();
                if !cancelled {
                    warn!(
                        run_id = %ctx.run_id,
                        order_id = %order.id,
                        "rollback cancel failed"
                    );
                }
                entries.push(json!({
                    "account_id": order.account_id,
                    "broker_order_id": broker_order_id,
                    "cancelled": cancelled,
                }));
            }
        };
        if timeout(deadline, work).await.is_err() {
            warn!(run_id = %ctx.run_id, "rollback deadline elapsed");
        }
        Value::Array(entries)
    }
}

fn leg_command(intent: &TradeIntent, slice: &AllocationSlice, run_id: RunId) -> OrderCommand {
    OrderCommand {
        symbol: intent.symbol.clone(),
        side: intent.side,
        quantity: i64::from(slice.lots) * i64::from(intent.lot_size),
        order_type: intent.order_type,
        price: intent.price,
        take_profit: intent.take_profit,
        stop_loss: intent.stop_loss,
        exchange: intent.exchange.clone(),
        symbol_token: intent.symbol_token.clone(),
        tag: Some(format!("run-{}", run_id.simple())),
    }
}

/// Dispatch one leg and record its terminal event.
async fn dispatch_one(ctx: &LegContext, leg: &DispatchLeg) -> LegOutcome {
    let requested_at = Utc::now();
    let mut journal_failed = ctx
        .journal
        .append_event(
            ctx.run_id,
            NewEvent {
                account_id: Some(leg.slice.account_id),
                requested_at,
                ..NewEvent::status_only(LegStatus::Requested)
            },
        )
        .is_err();

    let started = std::time::Instant::now();
    let result = ctx.gateway.place(leg.slice.account_id, &leg.command).await;
    let completed_at = Utc::now();
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    let reservation = ctx.reservations.lock()[leg.index].take();
    let (status, order, message, metadata) = match result {
        Ok(placement) => {
            if let Some(reservation) = reservation {
                ctx.rms.commit(reservation);
            }
            let status = match placement.status {
                PlacementStatus::Filled => LegStatus::Filled,
                PlacementStatus::Accepted | PlacementStatus::Pending => LegStatus::Accepted,
            };
            let order = Order {
                id: Uuid::new_v4(),
                account_id: leg.slice.account_id,
                strategy_id: None,
                run_id: Some(ctx.run_id),
                broker_order_id: Some(placement.broker_order_id.clone()),
                symbol: leg.command.symbol.clone(),
                side: leg.command.side,
                quantity: leg.command.quantity,
                order_type: leg.command.order_type,
                price: placement.avg_fill_price.or(leg.command.price),
                take_profit: leg.command.take_profit,
                stop_loss: leg.command.stop_loss,
                state: match status {
                    LegStatus::Filled => OrderState::Filled,
                    _ => OrderState::Accepted,
                },
                created_at: requested_at,
                updated_at: completed_at,
            };
            (status, Some(order), placement.message, placement.metadata)
        }
        Err(err) => {
            if let Some(reservation) = reservation {
                ctx.rms.release(reservation);
            }
            ctx.failures.fetch_add(1, Ordering::SeqCst);
            let status = match err {
                BrokerError::Rejected(_) => LegStatus::Rejected,
                _ => LegStatus::Error,
            };
            (status, None, Some(err.to_string()), Value::Null)
        }
    };

    journal_failed |= ctx
        .journal
        .append_event(
            ctx.run_id,
            NewEvent {
                account_id: Some(leg.slice.account_id),
                order_id: order.as_ref().map(|o| o.id),
                status,
                requested_at,
                completed_at: Some(completed_at),
                latency_ms: Some(latency_ms),
                message,
                metadata,
            },
        )
        .is_err();

    LegOutcome {
        index: leg.index,
        status,
        order,
        latency_ms: Some(latency_ms),
        journal_failed,
    }
}

/// Mark a leg skipped before any network I/O happened.
fn skip_leg(ctx: &LegContext, leg: &DispatchLeg, reason: &str) -> LegOutcome {
    if let Some(reservation) = ctx.reservations.lock()[leg.index].take() {
        ctx.rms.release(reservation);
    }
    let journal_failed = ctx
        .journal
        .append_event(
            ctx.run_id,
            NewEvent {
                account_id: Some(leg.slice.account_id),
                completed_at: Some(Utc::now()),
                message: Some(reason.to_string()),
                ..NewEvent::status_only(LegStatus::CancelledBeforeSend)
            },
        )
        .is_err();
    LegOutcome {
        index: leg.index,
        status: LegStatus::CancelledBeforeSend,
        order: None,
        latency_ms: None,
        journal_failed,
    }
}

fn intent_payload(intent: &TradeIntent) -> Value {
    json!({
        "symbol": intent.symbol,
        "side": intent.side,
        "order_type": intent.order_type,
        "lots": intent.total_lots,
        "lot_size": intent.lot_size,
    })
}

fn finalize_payload(
    intent: &TradeIntent,
    allocation: &Allocation,
    orders: &[(usize, Order, Option<f64>)],
    latency: &Option<LatencySummary>,
    rollback: Value,
) -> Value {
    let mut payload = intent_payload(intent);
    payload["order_ids"] = json!(orders
        .iter()
        .map(|(_, order, _)| order.id)
        .collect::<Vec<_>>());
    payload["distribution"] = json!(allocation
        .slices
        .iter()
        .map(|slice| {
            json!({
                "account_id": slice.account_id,
                "broker_id": slice.link_id,
                "lots": slice.lots,
                "quantity": i64::from(slice.lots) * i64::from(intent.lot_size),
            })
        })
        .collect::<Vec<_>>());
    if let Some(summary) = latency {
        payload["latency"] = json!(summary);
    }
    if !rollback.is_null() {
        payload["rollback"] = rollback;
    }
    payload
}
