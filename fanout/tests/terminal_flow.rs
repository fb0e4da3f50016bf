//! Full-stack flows through the service facade with the paper broker.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use fanout::prelude::*;
use fanout::CoreError;
use fanout_core::wire::ErrorCode;
use fanout_scheduler::{FieldMap, TransformSpec};
use fanout_strategy::StrategyKind;
use fanout_vault::Secrets;

async fn services_with_paper_group(
    user_id: Uuid,
    accounts: usize,
    mode: ExecutionMode,
) -> (CoreServices, GroupId) {
    let config = AppConfig::default();
    let registry = Arc::new(AdapterRegistry::new().register(Arc::new(PaperFactory)));
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let services = CoreServices::new(&config, registry, journal);

    let group = services.groups().create(user_id, "primary", mode, None);
    for n in 0..accounts {
        let link = services
            .connect_broker(
                user_id,
                "paper_trading",
                &format!("CLIENT-{n}"),
                &Secrets::new().with("client_code", format!("CLIENT-{n}")),
                &serde_json::Value::Null,
            )
            .await
            .expect("paper connect");
        let account = services.fleet().accounts_for(link.id).remove(0);
        services
            .add_group_account(
                user_id,
                group.id,
                account.id,
                AllocationPolicy::Proportional,
                None,
                None,
            )
            .expect("mapping added");
    }
    (services, group.id)
}

fn order_request(lots: u32) -> GroupOrderRequest {
    GroupOrderRequest {
        symbol: "NIFTY24AUGFUT".into(),
        side: Side::Buy,
        lots,
        lot_size: 25,
        order_type: OrderType::Market,
        price: Some(Decimal::from(205)),
        take_profit: None,
        stop_loss: None,
        strategy_id: None,
    }
}

#[tokio::test]
async fn manual_group_order_flows_into_ledger_and_analytics() {
    let user_id = Uuid::new_v4();
    let (services, group_id) =
        services_with_paper_group(user_id, 2, ExecutionMode::Parallel).await;

    let response = services
        .place_group_order(user_id, group_id, &order_request(10), CancelToken::new())
        .await
        .expect("order placed");

    assert_eq!(response.allocation.len(), 2);
    assert_eq!(response.orders.len(), 2);
    let total: u32 = response.allocation.iter().map(|a| a.lots).sum();
    assert_eq!(total, 10);

    // Orders landed in the ledger and the position is open.
    let orders = services.orders(user_id);
    assert_eq!(orders.len(), 2);

    let dashboard = services.dashboard(user_id).unwrap();
    assert_eq!(dashboard.summary.execution_run_count, 1);
    assert_eq!(dashboard.summary.failed_execution_runs, 0);
    assert_eq!(dashboard.summary.leg_status_counts["filled"], 2);
    assert!(dashboard.summary.avg_execution_latency_ms.is_some());
    assert_eq!(dashboard.open_positions.len(), 2);

    let events = services
        .run_events(user_id, group_id, response.execution_run_id)
        .unwrap();
    assert!(!events.is_empty());

    let csv = services.leg_status_csv(user_id).unwrap();
    assert!(csv.starts_with("status,count"));
    assert!(csv.contains("filled,2"));
}

#[tokio::test]
async fn allocation_preview_matches_dispatched_split() {
    let user_id = Uuid::new_v4();
    let (services, group_id) =
        services_with_paper_group(user_id, 3, ExecutionMode::Parallel).await;

    let preview = services.preview_allocation(user_id, group_id, 10).unwrap();
    let lots: Vec<u32> = preview.iter().map(|entry| entry.lots).collect();
    assert_eq!(lots, vec![4, 3, 3]);
}

#[tokio::test]
async fn webhook_duplicate_delivery_returns_conflict_with_first_run() {
    let user_id = Uuid::new_v4();
    let (services, group_id) = services_with_paper_group(user_id, 1, ExecutionMode::Parallel).await;

    let strategy = services.create_strategy(
        user_id,
        "webhook-momentum",
        StrategyKind::Connector,
        json!({
            "execution_group_id": group_id.to_string(),
            "symbol": "NIFTY24AUGFUT",
            "side": "BUY",
            "lots": 2,
            "lot_size": 25,
            "price": 205,
        }),
    );
    services
        .register_webhook(
            user_id,
            strategy.id,
            "tok-abc123",
            TransformSpec {
                mappings: vec![FieldMap {
                    from: "qty".into(),
                    to: "lots".into(),
                }],
                defaults: json!({}),
            },
        )
        .unwrap();

    let payload = json!({ "qty": 3 });
    let first = services
        .deliver_webhook("tok-abc123", &payload)
        .await
        .expect("first delivery accepted");

    let err = services
        .deliver_webhook("tok-abc123", &payload)
        .await
        .expect_err("second delivery dropped");
    let envelope = err.envelope();
    assert_eq!(envelope.error.code, ErrorCode::Conflict);
    assert_eq!(
        envelope.error.details.unwrap()["strategy_run_id"],
        json!(first.strategy_run_id)
    );

    // Exactly one strategy run, linked to exactly one execution run.
    let runs = services.strategy_runs(user_id, strategy.id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].execution_run_ids.len(), 1);

    // The override from the payload drove the lot count.
    assert_eq!(runs[0].result_metrics["total_lots"], 3);
}

#[tokio::test]
async fn wrong_webhook_token_is_unauthorized() {
    let user_id = Uuid::new_v4();
    let (services, _) = services_with_paper_group(user_id, 1, ExecutionMode::Parallel).await;
    let err = services
        .deliver_webhook("tok-unknown", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::WebhookUnauthorized));
    assert_eq!(err.envelope().error.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn single_order_path_gates_through_rms() {
    let user_id = Uuid::new_v4();
    let (services, _) = services_with_paper_group(user_id, 1, ExecutionMode::Parallel).await;
    let account = services.orders(user_id).first().map(|o| o.account_id);
    assert!(account.is_none(), "no orders yet");
    let link = services.broker_links(user_id).remove(0);
    let account = services.fleet().accounts_for(link.id).remove(0);

    let intent = TradeIntent {
        symbol: "NIFTY24AUGFUT".into(),
        side: Side::Buy,
        total_lots: 2,
        lot_size: 25,
        order_type: OrderType::Market,
        price: Some(Decimal::from(205)),
        take_profit: None,
        stop_loss: None,
        exchange: None,
        symbol_token: None,
    };
    let order = services
        .place_order(user_id, account.id, &intent)
        .await
        .expect("single order placed");
    assert_eq!(order.quantity, 50);
    assert!(order
        .broker_order_id
        .as_deref()
        .is_some_and(|id| id.starts_with("PAPER-ORD-")));

    // A per-order limit now trips the same path.
    services.set_rms_config(
        user_id,
        RmsConfig {
            max_lots_per_order: Some(1),
            ..RmsConfig::default()
        },
    );
    let err = services
        .place_order(user_id, account.id, &intent)
        .await
        .unwrap_err();
    assert_eq!(err.envelope().error.code, ErrorCode::RmsMaxLots);
}

#[tokio::test]
async fn square_off_closes_open_positions() {
    let user_id = Uuid::new_v4();
    let (services, group_id) =
        services_with_paper_group(user_id, 2, ExecutionMode::Parallel).await;

    services
        .place_group_order(user_id, group_id, &order_request(4), CancelToken::new())
        .await
        .unwrap();
    assert_eq!(services.dashboard(user_id).unwrap().open_positions.len(), 2);

    let report = services.square_off(user_id, None).await.unwrap();
    assert!(report.triggered);
    assert_eq!(report.positions.len(), 2);

    let dashboard = services.dashboard(user_id).unwrap();
    assert!(dashboard.open_positions.is_empty(), "positions flattened");
}

#[tokio::test]
async fn rms_rejection_surfaces_partial_status_in_group_runs() {
    let user_id = Uuid::new_v4();
    let (services, group_id) =
        services_with_paper_group(user_id, 3, ExecutionMode::Parallel).await;
    services.set_rms_config(
        user_id,
        RmsConfig {
            max_daily_lots: Some(4),
            ..RmsConfig::default()
        },
    );

    services
        .place_group_order(user_id, group_id, &order_request(10), CancelToken::new())
        .await
        .unwrap();

    let runs = services.group_runs(user_id, group_id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Partial);

    let status = services.rms_status(user_id);
    assert_eq!(status.lots_used, 4);
    assert_eq!(status.lots_remaining, Some(0));
    assert!(!status.alerts.is_empty());
}
