//! End-to-end fan-out against the paper broker with durable telemetry.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use fanout_broker::{AdapterDeadlines, AdapterRegistry, BrokerFleet};
use fanout_core::{
    AllocationPolicy, ExecutionGroup, ExecutionMode, GroupAccountMapping, LegStatus, OrderType,
    RunStatus, Side, TradeIntent,
};
use fanout_execution::{AccountGateway, CancelToken, ExecutionConfig, Orchestrator};
use fanout_journal::{Journal, SqliteJournal};
use fanout_paper::PaperFactory;
use fanout_rms::{AuditLog, RmsConfig, RmsEngine};
use fanout_vault::{CredentialVault, Secrets};

async fn paper_fleet(user_id: Uuid, links: usize) -> (Arc<BrokerFleet>, Vec<GroupAccountMapping>) {
    let registry = Arc::new(AdapterRegistry::new().register(Arc::new(PaperFactory)));
    let vault = Arc::new(CredentialVault::new("integration-key"));
    let fleet = Arc::new(BrokerFleet::new(
        registry,
        vault,
        AdapterDeadlines::default(),
    ));

    let mut mappings = Vec::new();
    for n in 0..links {
        let link = fleet
            .connect(
                user_id,
                "paper",
                &format!("CLIENT-{n}"),
                &Secrets::new().with("client_code", format!("CLIENT-{n}")),
                &serde_json::Value::Null,
            )
            .await
            .expect("paper connect");
        let account = fleet.accounts_for(link.id).remove(0);
        mappings.push(GroupAccountMapping {
            id: Uuid::new_v4(),
            account_id: account.id,
            link_id: link.id,
            policy: AllocationPolicy::Proportional,
            weight: None,
            fixed_lots: None,
        });
    }
    (fleet, mappings)
}

fn group(user_id: Uuid, mode: ExecutionMode, mappings: Vec<GroupAccountMapping>) -> ExecutionGroup {
    ExecutionGroup {
        id: Uuid::new_v4(),
        user_id,
        name: "paper fan-out".into(),
        description: None,
        mode,
        mappings,
        created_at: Utc::now(),
    }
}

fn market_intent(lots: u32) -> TradeIntent {
    TradeIntent {
        symbol: "NIFTY24AUGFUT".into(),
        side: Side::Buy,
        total_lots: lots,
        lot_size: 25,
        order_type: OrderType::Market,
        price: Some(Decimal::from(210)),
        take_profit: None,
        stop_loss: None,
        exchange: Some("NFO".into()),
        symbol_token: None,
    }
}

fn rms() -> Arc<RmsEngine> {
    let offset = chrono::FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
    Arc::new(RmsEngine::new(offset, Arc::new(AuditLog::new())))
}

#[tokio::test]
async fn paper_fanout_round_trip_with_durable_journal() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("journal.db");
    let user_id = Uuid::new_v4();
    let (fleet, mappings) = paper_fleet(user_id, 2).await;
    let group = group(user_id, ExecutionMode::Parallel, mappings);

    let journal = Arc::new(SqliteJournal::new(&journal_path).unwrap());
    let orchestrator = Orchestrator::new(
        fleet.clone() as Arc<dyn AccountGateway>,
        rms(),
        journal.clone() as Arc<dyn Journal>,
        ExecutionConfig::default(),
    );

    let report = orchestrator
        .execute(user_id, &group, &market_intent(10), None, CancelToken::new())
        .await
        .expect("run completes");

    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert_eq!(report.allocation.assigned_lots(), 10);
    assert_eq!(report.orders.len(), 2);
    for order in &report.orders {
        let id = order.broker_order_id.as_deref().unwrap();
        assert!(id.starts_with("PAPER-ORD-"), "unexpected id {id}");
        assert_eq!(order.quantity, 125);
    }

    // Telemetry survives a process restart.
    drop(journal);
    let reopened = SqliteJournal::new(&journal_path).unwrap();
    let runs = reopened.runs_for_group(group.id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);

    let events = reopened.events(report.run.id).unwrap();
    let terminal: Vec<_> = events.iter().filter(|e| e.status.is_terminal()).collect();
    assert_eq!(terminal.len(), 2);
    for event in terminal {
        assert_eq!(event.status, LegStatus::Filled);
        let latency = event.latency_ms.expect("latency recorded");
        assert!(latency >= 0.0);
        assert!(event.completed_at.is_some());
    }
}

#[tokio::test]
async fn daily_lot_limit_splits_run_between_accept_and_reject() {
    let user_id = Uuid::new_v4();
    let (fleet, mappings) = paper_fleet(user_id, 3).await;
    let group = group(user_id, ExecutionMode::Parallel, mappings);

    let risk = rms();
    risk.set_config(
        user_id,
        RmsConfig {
            max_daily_lots: Some(4),
            ..RmsConfig::default()
        },
    );

    let journal = Arc::new(fanout_journal::MemoryJournal::new());
    let orchestrator = Orchestrator::new(
        fleet as Arc<dyn AccountGateway>,
        risk.clone(),
        journal as Arc<dyn Journal>,
        ExecutionConfig::default(),
    );

    // Allocation [4,3,3]: the first leg fits the limit, the rest reject.
    let report = orchestrator
        .execute(user_id, &group, &market_intent(10), None, CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Partial);
    assert_eq!(report.leg_statuses[0], LegStatus::Filled);
    assert_eq!(report.leg_statuses[1], LegStatus::Rejected);
    assert_eq!(report.leg_statuses[2], LegStatus::Rejected);

    let counters = risk.counters_snapshot(user_id);
    assert_eq!(counters.lots_committed, 4);
    assert_eq!(counters.reserved_lots, 0);
}
