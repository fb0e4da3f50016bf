//! Service facade: the typed operations an HTTP transport exposes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use fanout_analytics::{AnalyticsService, Dashboard, DailyPnlPoint, LatencyExport};
use fanout_broker::{
    AdapterDeadlines, AdapterRegistry, BrokerFleet, BrokerLink, BrokerPosition, ConversionRequest,
    Holding, OrderCommand,
};
use fanout_config::AppConfig;
use fanout_core::wire::{AllocationResult, GroupOrderRequest, GroupOrderResponse};
use fanout_core::{
    AccountId, AllocationPolicy, ExecutionEvent, ExecutionGroup, ExecutionMode, ExecutionRun,
    GroupAccountMapping, GroupId, LinkId, Lots, MappingId, Order, OrderId, OrderType, Position,
    RunId, Side, StrategyId, StrategyRunId, TradeIntent, UserId,
};
use fanout_execution::{
    plan_allocation, AccountGateway, CancelToken, ExecutionConfig, Orchestrator, RunReport,
};
use fanout_journal::Journal;
use fanout_portfolio::PortfolioLedger;
use fanout_rms::{AuditEntry, EnforcementAction, RmsConfig, RmsEngine, RmsStatus};
use fanout_scheduler::{
    ScheduledJob, Scheduler, StrategyTrigger, TransformSpec, WebhookConnector, WebhookGateway,
    WebhookOutcome,
};
use fanout_strategy::{
    ExecutionBackend, ExecutionSummary, FailurePolicy, StrategyEngine, StrategyError, StrategyKind,
    StrategyMode, StrategyResult, StrategyRun, StrategySpec,
};
use fanout_vault::{CredentialVault, Secrets};

use crate::api::{CoreError, CoreResult};

/// In-memory registry of execution groups and their account mappings.
#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<GroupId, ExecutionGroup>>,
}

impl GroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        user_id: UserId,
        name: &str,
        mode: ExecutionMode,
        description: Option<String>,
    ) -> ExecutionGroup {
        let group = ExecutionGroup {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            description,
            mode,
            mappings: Vec::new(),
            created_at: Utc::now(),
        };
        self.groups.write().insert(group.id, group.clone());
        group
    }

    pub fn get_owned(&self, user_id: UserId, group_id: GroupId) -> CoreResult<ExecutionGroup> {
        let groups = self.groups.read();
        let group = groups
            .get(&group_id)
            .ok_or(CoreError::NotFound("execution group"))?;
        if group.user_id != user_id {
            return Err(CoreError::Unauthorized("execution group"));
        }
        Ok(group.clone())
    }

    #[must_use]
    pub fn list_for(&self, user_id: UserId) -> Vec<ExecutionGroup> {
        let mut groups: Vec<ExecutionGroup> = self
            .groups
            .read()
            .values()
            .filter(|group| group.user_id == user_id)
            .cloned()
            .collect();
        groups.sort_by_key(|group| group.created_at);
        groups
    }

    pub fn update(
        &self,
        user_id: UserId,
        group_id: GroupId,
        name: Option<String>,
        mode: Option<ExecutionMode>,
        description: Option<String>,
    ) -> CoreResult<ExecutionGroup> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(CoreError::NotFound("execution group"))?;
        if group.user_id != user_id {
            return Err(CoreError::Unauthorized("execution group"));
        }
        if let Some(name) = name {
            group.name = name;
        }
        if let Some(mode) = mode {
            group.mode = mode;
        }
        if let Some(description) = description {
            group.description = Some(description);
        }
        Ok(group.clone())
    }

    pub fn delete(&self, user_id: UserId, group_id: GroupId) -> CoreResult<()> {
        let mut groups = self.groups.write();
        match groups.get(&group_id) {
            Some(group) if group.user_id == user_id => {
                groups.remove(&group_id);
                Ok(())
            }
            Some(_) => Err(CoreError::Unauthorized("execution group")),
            None => Err(CoreError::NotFound("execution group")),
        }
    }

    pub fn add_mapping(
        &self,
        user_id: UserId,
        group_id: GroupId,
        mapping: GroupAccountMapping,
    ) -> CoreResult<GroupAccountMapping> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(CoreError::NotFound("execution group"))?;
        if group.user_id != user_id {
            return Err(CoreError::Unauthorized("execution group"));
        }
        group.mappings.push(mapping.clone());
        if let Err(err) = group.validate() {
            group.mappings.pop();
            return Err(CoreError::Validation(err.to_string()));
        }
        Ok(mapping)
    }

    pub fn update_mapping(
        &self,
        user_id: UserId,
        group_id: GroupId,
        mapping_id: MappingId,
        policy: Option<AllocationPolicy>,
        weight: Option<Decimal>,
        fixed_lots: Option<Lots>,
    ) -> CoreResult<GroupAccountMapping> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(CoreError::NotFound("execution group"))?;
        if group.user_id != user_id {
            return Err(CoreError::Unauthorized("execution group"));
        }
        let before = group.mappings.clone();
        let mapping = group
            .mappings
            .iter_mut()
            .find(|m| m.id == mapping_id)
            .ok_or(CoreError::NotFound("account mapping"))?;
        if let Some(policy) = policy {
            mapping.policy = policy;
        }
        if let Some(weight) = weight {
            mapping.weight = Some(weight);
        }
        if let Some(fixed) = fixed_lots {
            mapping.fixed_lots = Some(fixed);
        }
        let updated = mapping.clone();
        if let Err(err) = group.validate() {
            group.mappings = before;
            return Err(CoreError::Validation(err.to_string()));
        }
        Ok(updated)
    }

    pub fn remove_mapping(
        &self,
        user_id: UserId,
        group_id: GroupId,
        mapping_id: MappingId,
    ) -> CoreResult<()> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(CoreError::NotFound("execution group"))?;
        if group.user_id != user_id {
            return Err(CoreError::Unauthorized("execution group"));
        }
        let len_before = group.mappings.len();
        group.mappings.retain(|mapping| mapping.id != mapping_id);
        if group.mappings.len() == len_before {
            return Err(CoreError::NotFound("account mapping"));
        }
        Ok(())
    }
}

/// Per-user portfolio ledgers, created on first use.
#[derive(Default)]
struct LedgerMap {
    inner: RwLock<HashMap<UserId, Arc<PortfolioLedger>>>,
}

impl LedgerMap {
    fn for_user(&self, user_id: UserId) -> Arc<PortfolioLedger> {
        if let Some(ledger) = self.inner.read().get(&user_id) {
            return Arc::clone(ledger);
        }
        let mut map = self.inner.write();
        Arc::clone(
            map.entry(user_id)
                .or_insert_with(|| Arc::new(PortfolioLedger::new())),
        )
    }
}

/// Outcome of a square-off request.
#[derive(Clone, Debug)]
pub struct SquareOffReport {
    pub triggered: bool,
    pub message: String,
    pub positions: Vec<Position>,
}

/// Strategy-facing execution backend: resolves the group, drives the
/// orchestrator, and folds the results into the user's ledger.
struct OrchestratorBackend {
    orchestrator: Arc<Orchestrator>,
    groups: Arc<GroupRegistry>,
    ledgers: Arc<LedgerMap>,
    rms: Arc<RmsEngine>,
    cancels: Arc<Mutex<HashMap<StrategyRunId, CancelToken>>>,
}

#[async_trait]
impl ExecutionBackend for OrchestratorBackend {
    async fn run_group_order(
        &self,
        user_id: UserId,
        group_id: GroupId,
        intent: TradeIntent,
        strategy_id: StrategyId,
        strategy_run_id: StrategyRunId,
    ) -> StrategyResult<ExecutionSummary> {
        let group = self
            .groups
            .get_owned(user_id, group_id)
            .map_err(|err| StrategyError::InvalidParams(err.to_string()))?;

        let cancel = CancelToken::new();
        self.cancels.lock().insert(strategy_run_id, cancel.clone());
        let result = self
            .orchestrator
            .execute(user_id, &group, &intent, Some(strategy_run_id), cancel)
            .await;
        self.cancels.lock().remove(&strategy_run_id);

        let mut report = result.map_err(|err| StrategyError::Execution(err.to_string()))?;
        for order in &mut report.orders {
            order.strategy_id = Some(strategy_id);
        }
        absorb_report(&self.ledgers.for_user(user_id), &self.rms, user_id, &report);

        let mut leg_status_counts = BTreeMap::new();
        for status in &report.leg_statuses {
            let key = serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{status:?}"));
            *leg_status_counts.entry(key).or_insert(0usize) += 1;
        }
        Ok(ExecutionSummary {
            execution_run_id: report.run.id,
            order_count: report.orders.len(),
            total_lots: report.allocation.total_lots,
            avg_latency_ms: report.run.latency.as_ref().map(|l| l.average_ms),
            leg_status_counts,
        })
    }
}

/// Record the orders and immediate fills of a run into the ledger and feed
/// realised PnL back into the RMS counters.
fn absorb_report(
    ledger: &PortfolioLedger,
    rms: &RmsEngine,
    user_id: UserId,
    report: &RunReport,
) {
    for order in &report.orders {
        ledger.record_order(order.clone());
        if order.state == fanout_core::OrderState::Filled {
            if let Some(price) = order.price {
                match ledger.apply_fill(order.id, order.quantity, price, order.updated_at) {
                    Ok(trade) => {
                        if !trade.realized_pnl.is_zero() {
                            rms.record_realized(user_id, trade.realized_pnl);
                        }
                    }
                    Err(err) => warn!(order_id = %order.id, error = %err, "fill bookkeeping failed"),
                }
            }
        }
    }
}

/// Trigger used by the scheduler and webhook gateway: starts a strategy
/// run, defaulting to paper mode unless the context says otherwise.
struct EngineTrigger {
    strategies: Arc<StrategyEngine>,
}

#[async_trait]
impl StrategyTrigger for EngineTrigger {
    async fn trigger(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        context: Value,
    ) -> Result<StrategyRunId, String> {
        let spec = self
            .strategies
            .get(strategy_id)
            .map_err(|err| err.to_string())?;
        if spec.user_id != user_id {
            return Err("strategy does not belong to this user".into());
        }
        let mode = match context.get("mode").and_then(Value::as_str) {
            Some("live") => StrategyMode::Live,
            Some("backtest") => StrategyMode::Backtest,
            _ => StrategyMode::Paper,
        };
        self.strategies
            .run(strategy_id, mode, Some(context))
            .await
            .map(|run| run.id)
            .map_err(|err| err.to_string())
    }
}

/// Wires every subsystem together and exposes the operations of the
/// external interface.
pub struct CoreServices {
    fleet: Arc<BrokerFleet>,
    rms: Arc<RmsEngine>,
    journal: Arc<dyn Journal>,
    orchestrator: Arc<Orchestrator>,
    groups: Arc<GroupRegistry>,
    ledgers: Arc<LedgerMap>,
    strategies: Arc<StrategyEngine>,
    scheduler: Arc<Scheduler>,
    webhooks: Arc<WebhookGateway>,
    analytics: AnalyticsService,
    strategy_cancels: Arc<Mutex<HashMap<StrategyRunId, CancelToken>>>,
    scheduler_tick: std::time::Duration,
}

impl CoreServices {
    /// Assemble the core from configuration, a broker registry, and a
    /// journal backend.
    pub fn new(
        config: &AppConfig,
        registry: Arc<AdapterRegistry>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let vault = Arc::new(CredentialVault::new(&config.vault_key));
        let deadlines = AdapterDeadlines {
            place: config.timeouts.adapter_place(),
            metadata: config.timeouts.adapter_metadata(),
        };
        let fleet = Arc::new(BrokerFleet::new(registry, vault, deadlines));
        let rms = Arc::new(RmsEngine::new(
            config.exchange_offset(),
            Arc::new(fanout_rms::AuditLog::new()),
        ));
        let execution_config = ExecutionConfig {
            worker_pool: config.execution.worker_pool,
            run_deadline_parallel: std::time::Duration::from_secs(config.timeouts.run_parallel_secs),
            run_deadline_staggered: std::time::Duration::from_secs(
                config.timeouts.run_staggered_secs,
            ),
            stagger_delay: std::time::Duration::from_millis(config.execution.stagger_delay_ms),
            stagger_abort_threshold: config.execution.stagger_abort_threshold,
            rollback_on_partial: config.execution.rollback_on_partial,
        };
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&fleet) as Arc<dyn AccountGateway>,
            Arc::clone(&rms),
            Arc::clone(&journal),
            execution_config,
        ));
        let groups = Arc::new(GroupRegistry::new());
        let ledgers = Arc::new(LedgerMap::default());
        let strategy_cancels = Arc::new(Mutex::new(HashMap::new()));
        let backend = Arc::new(OrchestratorBackend {
            orchestrator: Arc::clone(&orchestrator),
            groups: Arc::clone(&groups),
            ledgers: Arc::clone(&ledgers),
            rms: Arc::clone(&rms),
            cancels: Arc::clone(&strategy_cancels),
        });
        let strategies = Arc::new(StrategyEngine::new(
            backend,
            Arc::clone(&journal),
            FailurePolicy::default(),
        ));
        let trigger = Arc::new(EngineTrigger {
            strategies: Arc::clone(&strategies),
        });
        let scheduler = Arc::new(Scheduler::new(trigger.clone() as Arc<dyn StrategyTrigger>));
        let webhooks = Arc::new(WebhookGateway::new(
            trigger as Arc<dyn StrategyTrigger>,
            config.timeouts.webhook_window(),
        ));
        let analytics = AnalyticsService::new(Arc::clone(&journal));

        Self {
            fleet,
            rms,
            journal,
            orchestrator,
            groups,
            ledgers,
            strategies,
            scheduler,
            webhooks,
            analytics,
            strategy_cancels,
            scheduler_tick: config.timeouts.scheduler_tick(),
        }
    }

    // ------------------------------------------------------------------
    // Brokers
    // ------------------------------------------------------------------

    #[must_use]
    pub fn supported_brokers(&self) -> Vec<String> {
        self.fleet.supported_brokers()
    }

    pub async fn connect_broker(
        &self,
        user_id: UserId,
        kind: &str,
        client_code: &str,
        secrets: &Secrets,
        options: &Value,
    ) -> CoreResult<BrokerLink> {
        Ok(self
            .fleet
            .connect(user_id, kind, client_code, secrets, options)
            .await?)
    }

    #[must_use]
    pub fn broker_links(&self, user_id: UserId) -> Vec<BrokerLink> {
        self.fleet.links_for(user_id)
    }

    pub async fn broker_login(&self, user_id: UserId, link_id: LinkId) -> CoreResult<BrokerLink> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.login(link_id).await?)
    }

    pub async fn broker_logout(&self, user_id: UserId, link_id: LinkId) -> CoreResult<BrokerLink> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.logout(link_id).await?)
    }

    pub async fn delete_broker(&self, user_id: UserId, link_id: LinkId) -> CoreResult<()> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.remove(link_id).await?)
    }

    pub async fn broker_positions(
        &self,
        user_id: UserId,
        link_id: LinkId,
    ) -> CoreResult<Vec<BrokerPosition>> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.connection(link_id)?.positions().await?)
    }

    pub async fn broker_holdings(
        &self,
        user_id: UserId,
        link_id: LinkId,
    ) -> CoreResult<Vec<Holding>> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.connection(link_id)?.holdings().await?)
    }

    pub async fn convert_position(
        &self,
        user_id: UserId,
        link_id: LinkId,
        request: &ConversionRequest,
    ) -> CoreResult<Value> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.connection(link_id)?.convert_position(request).await?)
    }

    pub fn add_broker_account(
        &self,
        user_id: UserId,
        link_id: LinkId,
        broker_account_id: &str,
        currency: &str,
    ) -> CoreResult<fanout_broker::Account> {
        self.owned_link(user_id, link_id)?;
        Ok(self.fleet.add_account(link_id, broker_account_id, currency)?)
    }

    #[must_use]
    pub fn fleet(&self) -> Arc<BrokerFleet> {
        Arc::clone(&self.fleet)
    }

    fn owned_link(&self, user_id: UserId, link_id: LinkId) -> CoreResult<BrokerLink> {
        let link = self.fleet.link(link_id)?;
        if link.user_id != user_id {
            return Err(CoreError::Unauthorized("broker link"));
        }
        Ok(link)
    }

    // ------------------------------------------------------------------
    // Execution groups and orders
    // ------------------------------------------------------------------

    #[must_use]
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn add_group_account(
        &self,
        user_id: UserId,
        group_id: GroupId,
        account_id: AccountId,
        policy: AllocationPolicy,
        weight: Option<Decimal>,
        fixed_lots: Option<Lots>,
    ) -> CoreResult<GroupAccountMapping> {
        let account = self.fleet.account(account_id)?;
        if account.user_id != user_id {
            return Err(CoreError::Unauthorized("account"));
        }
        let mapping = GroupAccountMapping {
            id: Uuid::new_v4(),
            account_id,
            link_id: account.link_id,
            policy,
            weight,
            fixed_lots,
        };
        self.groups.add_mapping(user_id, group_id, mapping)
    }

    /// Deterministic allocation preview without dispatching anything.
    pub fn preview_allocation(
        &self,
        user_id: UserId,
        group_id: GroupId,
        lots: Lots,
    ) -> CoreResult<Vec<AllocationResult>> {
        let group = self.groups.get_owned(user_id, group_id)?;
        let allocation = plan_allocation(&group, lots)?;
        Ok(allocation
            .slices
            .iter()
            .map(|slice| AllocationResult {
                account_id: slice.account_id,
                broker_id: slice.link_id,
                lots: slice.lots,
                quantity: i64::from(slice.lots),
                allocation_policy: slice.policy,
                weight: slice.weight,
                fixed_lots: slice.fixed_lots,
            })
            .collect())
    }

    /// Place a fan-out order against a group (the manual path).
    pub async fn place_group_order(
        &self,
        user_id: UserId,
        group_id: GroupId,
        request: &GroupOrderRequest,
        cancel: CancelToken,
    ) -> CoreResult<GroupOrderResponse> {
        let group = self.groups.get_owned(user_id, group_id)?;
        let intent = TradeIntent {
            symbol: request.symbol.clone(),
            side: request.side,
            total_lots: request.lots,
            lot_size: request.lot_size,
            order_type: request.order_type,
            price: request.price,
            take_profit: request.take_profit,
            stop_loss: request.stop_loss,
            exchange: None,
            symbol_token: None,
        };
        let mut report = self
            .orchestrator
            .execute(user_id, &group, &intent, None, cancel)
            .await?;
        if let Some(strategy_id) = request.strategy_id {
            for order in &mut report.orders {
                order.strategy_id = Some(strategy_id);
            }
        }
        absorb_report(&self.ledgers.for_user(user_id), &self.rms, user_id, &report);

        Ok(GroupOrderResponse {
            execution_run_id: report.run.id,
            allocation: report
                .allocation
                .slices
                .iter()
                .map(|slice| AllocationResult {
                    account_id: slice.account_id,
                    broker_id: slice.link_id,
                    lots: slice.lots,
                    quantity: i64::from(slice.lots) * i64::from(intent.lot_size),
                    allocation_policy: slice.policy,
                    weight: slice.weight,
                    fixed_lots: slice.fixed_lots,
                })
                .collect(),
            orders: report.orders.iter().map(|order| order.id).collect(),
        })
    }

    pub fn group_runs(&self, user_id: UserId, group_id: GroupId) -> CoreResult<Vec<ExecutionRun>> {
        self.groups.get_owned(user_id, group_id)?;
        Ok(self.journal.runs_for_group(group_id)?)
    }

    pub fn run_events(
        &self,
        user_id: UserId,
        group_id: GroupId,
        run_id: RunId,
    ) -> CoreResult<Vec<ExecutionEvent>> {
        self.groups.get_owned(user_id, group_id)?;
        let run = self
            .journal
            .run(run_id)?
            .ok_or(CoreError::NotFound("execution run"))?;
        if run.group_id != Some(group_id) {
            return Err(CoreError::NotFound("execution run"));
        }
        Ok(self.journal.events(run_id)?)
    }

    /// Place a single order against one account (the direct manual path:
    /// RMS gate, then straight to the broker, no fan-out run).
    pub async fn place_order(
        &self,
        user_id: UserId,
        account_id: AccountId,
        intent: &TradeIntent,
    ) -> CoreResult<Order> {
        intent
            .validate()
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        let account = self.fleet.account(account_id)?;
        if account.user_id != user_id {
            return Err(CoreError::Unauthorized("account"));
        }

        let ref_price = match intent.price {
            Some(price) => price,
            None => self
                .fleet
                .connection(account.link_id)?
                .last_price(&intent.symbol)
                .await
                .unwrap_or(Decimal::ZERO),
        };
        let reservation = self.rms.pre_trade(
            user_id,
            &fanout_rms::LegCheck {
                lots: intent.total_lots,
                lot_size: intent.lot_size,
                ref_price,
                margin_available: account.margin_available,
            },
        )?;

        let command = OrderCommand {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.quantity(),
            order_type: intent.order_type,
            price: intent.price,
            take_profit: intent.take_profit,
            stop_loss: intent.stop_loss,
            exchange: intent.exchange.clone(),
            symbol_token: intent.symbol_token.clone(),
            tag: None,
        };
        let placement = match self.fleet.place_for_account(account_id, &command).await {
            Ok(placement) => {
                self.rms.commit(reservation);
                placement
            }
            Err(err) => {
                self.rms.release(reservation);
                return Err(err.into());
            }
        };

        let filled = placement.status == fanout_broker::PlacementStatus::Filled;
        let order = Order {
            id: Uuid::new_v4(),
            account_id,
            strategy_id: None,
            run_id: None,
            broker_order_id: Some(placement.broker_order_id.clone()),
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: command.quantity,
            order_type: intent.order_type,
            price: placement.avg_fill_price.or(intent.price),
            take_profit: intent.take_profit,
            stop_loss: intent.stop_loss,
            state: if filled {
                fanout_core::OrderState::Filled
            } else {
                fanout_core::OrderState::Accepted
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let ledger = self.ledgers.for_user(user_id);
        ledger.record_order(order.clone());
        if filled {
            if let Some(price) = order.price {
                if let Ok(trade) = ledger.apply_fill(order.id, order.quantity, price, Utc::now()) {
                    if !trade.realized_pnl.is_zero() {
                        self.rms.record_realized(user_id, trade.realized_pnl);
                    }
                }
            }
        }
        Ok(order)
    }

    #[must_use]
    pub fn orders(&self, user_id: UserId) -> Vec<Order> {
        self.ledgers.for_user(user_id).all_orders()
    }

    pub async fn cancel_order(&self, user_id: UserId, order_id: OrderId) -> CoreResult<Order> {
        let ledger = self.ledgers.for_user(user_id);
        let order = ledger
            .order(order_id)
            .ok_or(CoreError::NotFound("order"))?;
        if let Some(broker_order_id) = order.broker_order_id.as_deref() {
            if let Err(err) = self.fleet.cancel_for_account(order.account_id, broker_order_id).await
            {
                warn!(order_id = %order_id, error = %err, "broker cancel failed; marking locally");
            }
        }
        Ok(ledger.mark_order_cancelled(order_id)?)
    }

    // ------------------------------------------------------------------
    // RMS
    // ------------------------------------------------------------------

    #[must_use]
    pub fn rms_config(&self, user_id: UserId) -> RmsConfig {
        self.rms.config(user_id)
    }

    pub fn set_rms_config(&self, user_id: UserId, config: RmsConfig) {
        self.rms.set_config(user_id, config);
    }

    #[must_use]
    pub fn rms_status(&self, user_id: UserId) -> RmsStatus {
        self.rms.status(user_id)
    }

    #[must_use]
    pub fn rms_audit(&self, user_id: UserId) -> Vec<AuditEntry> {
        self.rms.audit_log().for_user(user_id)
    }

    /// Run the enforcement sweep and execute any square-off it demands.
    pub async fn rms_enforce(&self, user_id: UserId) -> CoreResult<Vec<EnforcementAction>> {
        let actions = self.rms.enforce(user_id);
        for action in &actions {
            if let EnforcementAction::SquareOff { message, .. } = action {
                self.square_off(user_id, Some(message.clone())).await?;
            }
        }
        Ok(actions)
    }

    /// Periodic enforcement sweep across every configured user.
    pub fn spawn_rms_sweep(
        self: Arc<Self>,
        every: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let services = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                for user_id in services.rms.configured_users() {
                    if let Err(err) = services.rms_enforce(user_id).await {
                        warn!(user_id = %user_id, error = %err, "rms sweep failed");
                    }
                }
            }
        })
    }

    /// Close every open position with counter orders, best-effort.
    pub async fn square_off(
        &self,
        user_id: UserId,
        reason: Option<String>,
    ) -> CoreResult<SquareOffReport> {
        let ledger = self.ledgers.for_user(user_id);
        let open = ledger.open_positions();
        let message = reason.unwrap_or_else(|| "manual square-off requested".to_string());
        if open.is_empty() {
            return Ok(SquareOffReport {
                triggered: false,
                message,
                positions: Vec::new(),
            });
        }

        for position in &open {
            let side = if position.net_qty > 0 {
                Side::Sell
            } else {
                Side::Buy
            };
            let command = OrderCommand {
                symbol: position.symbol.clone(),
                side,
                quantity: position.net_qty.abs(),
                order_type: OrderType::Market,
                price: None,
                take_profit: None,
                stop_loss: None,
                exchange: None,
                symbol_token: None,
                tag: Some("square-off".into()),
            };
            match self
                .fleet
                .place_for_account(position.account_id, &command)
                .await
            {
                Ok(placement) => {
                    let order = Order {
                        id: Uuid::new_v4(),
                        account_id: position.account_id,
                        strategy_id: None,
                        run_id: None,
                        broker_order_id: Some(placement.broker_order_id.clone()),
                        symbol: position.symbol.clone(),
                        side,
                        quantity: position.net_qty.abs(),
                        order_type: OrderType::Market,
                        price: placement.avg_fill_price,
                        take_profit: None,
                        stop_loss: None,
                        state: fanout_core::OrderState::Filled,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    };
                    ledger.record_order(order.clone());
                    if let Some(price) = placement.avg_fill_price {
                        if let Ok(trade) =
                            ledger.apply_fill(order.id, order.quantity, price, Utc::now())
                        {
                            self.rms.record_realized(user_id, trade.realized_pnl);
                        }
                    }
                    self.rms.reduce_exposure(
                        user_id,
                        position.avg_price * Decimal::from(position.net_qty.abs()),
                    );
                }
                Err(err) => {
                    warn!(
                        account_id = %position.account_id,
                        symbol = %position.symbol,
                        error = %err,
                        "square-off leg failed"
                    );
                }
            }
        }
        info!(user_id = %user_id, positions = open.len(), "square-off executed");
        Ok(SquareOffReport {
            triggered: true,
            message,
            positions: open,
        })
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    pub fn create_strategy(
        &self,
        user_id: UserId,
        name: &str,
        kind: StrategyKind,
        params: Value,
    ) -> StrategySpec {
        self.strategies.create(user_id, name, kind, params)
    }

    #[must_use]
    pub fn strategies_for(&self, user_id: UserId) -> Vec<StrategySpec> {
        self.strategies.list_for(user_id)
    }

    pub async fn start_strategy(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        mode: StrategyMode,
        overrides: Option<Value>,
    ) -> CoreResult<StrategyRun> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self.strategies.run(strategy_id, mode, overrides).await?)
    }

    pub fn stop_strategy(&self, user_id: UserId, strategy_id: StrategyId) -> CoreResult<()> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self
            .strategies
            .set_status(strategy_id, fanout_strategy::StrategyStatus::Stopped)?)
    }

    pub fn strategy_runs(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
    ) -> CoreResult<Vec<StrategyRun>> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self.strategies.runs_for(strategy_id))
    }

    /// Cumulative (pnl, order count) across a strategy's runs.
    pub fn strategy_pnl(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
    ) -> CoreResult<(Decimal, usize)> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self.strategies.performance(strategy_id))
    }

    /// Cancel the most recent non-terminal execution run of a strategy run.
    pub fn cancel_strategy_run(&self, strategy_run_id: StrategyRunId) {
        if let Some(token) = self.strategy_cancels.lock().get(&strategy_run_id) {
            token.trigger();
        }
    }

    fn owned_strategy(&self, user_id: UserId, strategy_id: StrategyId) -> CoreResult<StrategySpec> {
        let spec = self.strategies.get(strategy_id)?;
        if spec.user_id != user_id {
            return Err(CoreError::Unauthorized("strategy"));
        }
        Ok(spec)
    }

    // ------------------------------------------------------------------
    // Scheduler and webhooks
    // ------------------------------------------------------------------

    pub fn schedule_strategy(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        name: &str,
        cron_expr: &str,
        context: Value,
    ) -> CoreResult<ScheduledJob> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self
            .scheduler
            .add_job(user_id, strategy_id, name, cron_expr, context)?)
    }

    #[must_use]
    pub fn scheduled_jobs(&self, user_id: UserId) -> Vec<ScheduledJob> {
        self.scheduler.jobs_for(user_id)
    }

    pub fn remove_scheduled_job(&self, job_id: fanout_core::JobId) -> CoreResult<()> {
        Ok(self.scheduler.remove_job(job_id)?)
    }

    /// Start the background scheduler loop.
    pub fn spawn_scheduler(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.scheduler).spawn(self.scheduler_tick)
    }

    pub fn register_webhook(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        token: &str,
        transform: TransformSpec,
    ) -> CoreResult<WebhookConnector> {
        self.owned_strategy(user_id, strategy_id)?;
        Ok(self.webhooks.register(user_id, strategy_id, token, transform))
    }

    /// Handle one inbound webhook delivery.
    pub async fn deliver_webhook(
        &self,
        token: &str,
        payload: &Value,
    ) -> CoreResult<WebhookOutcome> {
        Ok(self.webhooks.deliver(token, payload).await?)
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    pub fn dashboard(&self, user_id: UserId) -> CoreResult<Dashboard> {
        let ledger = self.ledgers.for_user(user_id);
        Ok(self.analytics.dashboard(user_id, &ledger, 7, 20)?)
    }

    pub fn daily_pnl(&self, user_id: UserId, days: u32) -> Vec<DailyPnlPoint> {
        let ledger = self.ledgers.for_user(user_id);
        self.analytics.daily_pnl(&ledger, days)
    }

    pub fn daily_pnl_csv(&self, user_id: UserId, days: u32) -> CoreResult<String> {
        let points = self.daily_pnl(user_id, days);
        Ok(self.analytics.daily_pnl_csv(&points)?)
    }

    pub fn latency_export(&self, user_id: UserId) -> CoreResult<Option<LatencyExport>> {
        Ok(self.analytics.latency_export(user_id)?)
    }

    pub fn latency_summary_csv(&self, user_id: UserId) -> CoreResult<Option<String>> {
        match self.analytics.latency_export(user_id)? {
            Some(export) => Ok(Some(self.analytics.latency_csv(&export)?)),
            None => Ok(None),
        }
    }

    pub fn leg_status_csv(&self, user_id: UserId) -> CoreResult<String> {
        let ledger = self.ledgers.for_user(user_id);
        let summary = self.analytics.summary(user_id, &ledger)?;
        Ok(self.analytics.leg_status_csv(&summary.leg_status_counts)?)
    }
}
