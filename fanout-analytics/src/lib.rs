//! Aggregated trading telemetry: dashboard summaries, daily PnL series,
//! latency percentiles, leg-status histograms, and stable-order exports.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use fanout_core::{percentile, Position, RunStatus, Trade, UserId};
use fanout_journal::Journal;
use fanout_portfolio::PortfolioLedger;

/// Result alias for analytics operations.
pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("journal error: {0}")]
    Journal(String),
    #[error("export serialization failed: {0}")]
    Export(String),
}

/// Headline numbers for the dashboard. Field order is the documented JSON
/// key order.
#[derive(Clone, Debug, Serialize)]
pub struct AnalyticsSummary {
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub today_realized_pnl: Decimal,
    pub total_trades: usize,
    pub open_positions: usize,
    pub execution_run_count: usize,
    pub failed_execution_runs: usize,
    pub avg_execution_latency_ms: Option<f64>,
    pub p50_execution_latency_ms: Option<f64>,
    pub p95_execution_latency_ms: Option<f64>,
    pub leg_status_counts: BTreeMap<String, usize>,
    pub updated_at: DateTime<Utc>,
}

/// One day of realised PnL.
#[derive(Clone, Debug, Serialize)]
pub struct DailyPnlPoint {
    pub date: NaiveDate,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub trade_count: usize,
}

/// Everything the dashboard endpoint returns.
#[derive(Clone, Debug, Serialize)]
pub struct Dashboard {
    pub summary: AnalyticsSummary,
    pub daily_pnl: Vec<DailyPnlPoint>,
    pub recent_trades: Vec<Trade>,
    pub open_positions: Vec<Position>,
}

/// Latency roll-up in export shape.
#[derive(Clone, Debug, Serialize)]
pub struct LatencyExport {
    pub count: usize,
    pub average_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// Read-side aggregator over the journal and a user's portfolio ledger.
pub struct AnalyticsService {
    journal: Arc<dyn Journal>,
}

impl AnalyticsService {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self { journal }
    }

    pub fn summary(
        &self,
        user_id: UserId,
        ledger: &PortfolioLedger,
    ) -> AnalyticsResult<AnalyticsSummary> {
        let trades = ledger.trades();
        let today_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);
        let today_realized: Decimal = trades
            .iter()
            .filter(|trade| trade.timestamp >= today_start)
            .map(|trade| trade.realized_pnl)
            .sum();

        let runs = self
            .journal
            .runs_for_user(user_id)
            .map_err(|err| AnalyticsError::Journal(err.to_string()))?;
        let failed = runs
            .iter()
            .filter(|run| matches!(run.status, RunStatus::Failed | RunStatus::RolledBack))
            .count();

        let events = self
            .journal
            .events_for_user(user_id)
            .map_err(|err| AnalyticsError::Journal(err.to_string()))?;
        let latencies: Vec<f64> = events.iter().filter_map(|event| event.latency_ms).collect();
        let avg = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        let mut leg_status_counts = BTreeMap::new();
        for event in events.iter().filter(|event| event.status.is_terminal()) {
            let key = serde_json::to_value(event.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", event.status));
            *leg_status_counts.entry(key).or_insert(0) += 1;
        }

        Ok(AnalyticsSummary {
            realized_pnl: ledger.realized_pnl(),
            unrealized_pnl: ledger.unrealized_pnl(),
            today_realized_pnl: today_realized,
            total_trades: trades.len(),
            open_positions: ledger.open_positions().len(),
            execution_run_count: runs.len(),
            failed_execution_runs: failed,
            avg_execution_latency_ms: avg,
            p50_execution_latency_ms: percentile(&latencies, 50.0),
            p95_execution_latency_ms: percentile(&latencies, 95.0),
            leg_status_counts,
            updated_at: Utc::now(),
        })
    }

    /// Realised PnL per day over the trailing `days` window, ISO-date
    /// ascending. Today's row carries the current unrealised PnL.
    pub fn daily_pnl(&self, ledger: &PortfolioLedger, days: u32) -> Vec<DailyPnlPoint> {
        let today = Utc::now().date_naive();
        let start = today - Duration::days(i64::from(days.saturating_sub(1)));
        let mut buckets: BTreeMap<NaiveDate, (Decimal, usize)> = BTreeMap::new();
        for trade in ledger.trades() {
            let day = trade.timestamp.date_naive();
            if day >= start {
                let entry = buckets.entry(day).or_insert((Decimal::ZERO, 0));
                entry.0 += trade.realized_pnl;
                entry.1 += 1;
            }
        }
        buckets
            .into_iter()
            .map(|(date, (realized, count))| DailyPnlPoint {
                date,
                realized_pnl: realized,
                unrealized_pnl: if date == today {
                    ledger.unrealized_pnl()
                } else {
                    Decimal::ZERO
                },
                trade_count: count,
            })
            .collect()
    }

    pub fn dashboard(
        &self,
        user_id: UserId,
        ledger: &PortfolioLedger,
        days: u32,
        trade_limit: usize,
    ) -> AnalyticsResult<Dashboard> {
        let mut recent = ledger.trades();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(trade_limit);
        Ok(Dashboard {
            summary: self.summary(user_id, ledger)?,
            daily_pnl: self.daily_pnl(ledger, days),
            recent_trades: recent,
            open_positions: ledger.open_positions(),
        })
    }

    /// `date,realized_pnl,unrealized_pnl,trade_count` ascending by date.
    pub fn daily_pnl_csv(&self, points: &[DailyPnlPoint]) -> AnalyticsResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["date", "realized_pnl", "unrealized_pnl", "trade_count"])
            .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        for point in points {
            writer
                .write_record([
                    point.date.to_string(),
                    point.realized_pnl.to_string(),
                    point.unrealized_pnl.to_string(),
                    point.trade_count.to_string(),
                ])
                .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        }
        finish_csv(writer)
    }

    pub fn latency_export(&self, user_id: UserId) -> AnalyticsResult<Option<LatencyExport>> {
        let events = self
            .journal
            .events_for_user(user_id)
            .map_err(|err| AnalyticsError::Journal(err.to_string()))?;
        let latencies: Vec<f64> = events.iter().filter_map(|event| event.latency_ms).collect();
        if latencies.is_empty() {
            return Ok(None);
        }
        let average = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let max = latencies.iter().cloned().fold(f64::MIN, f64::max);
        Ok(Some(LatencyExport {
            count: latencies.len(),
            average_ms: average,
            max_ms: max,
            p50_ms: percentile(&latencies, 50.0).unwrap_or(average),
            p95_ms: percentile(&latencies, 95.0).unwrap_or(average),
        }))
    }

    /// `count,average_ms,max_ms,p50_ms,p95_ms` as a single CSV row.
    pub fn latency_csv(&self, export: &LatencyExport) -> AnalyticsResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["count", "average_ms", "max_ms", "p50_ms", "p95_ms"])
            .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        writer
            .write_record([
                export.count.to_string(),
                format!("{:.4}", export.average_ms),
                format!("{:.4}", export.max_ms),
                format!("{:.4}", export.p50_ms),
                format!("{:.4}", export.p95_ms),
            ])
            .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        finish_csv(writer)
    }

    /// `status,count` rows sorted by status name.
    pub fn leg_status_csv(
        &self,
        counts: &BTreeMap<String, usize>,
    ) -> AnalyticsResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["status", "count"])
            .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        for (status, count) in counts {
            writer
                .write_record([status.clone(), count.to_string()])
                .map_err(|err| AnalyticsError::Export(err.to_string()))?;
        }
        finish_csv(writer)
    }
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> AnalyticsResult<String> {
    let bytes = writer
        .into_inner()
        .map_err(|err| AnalyticsError::Export(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| AnalyticsError::Export(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::{
        ExecutionRun, LegStatus, Order, OrderState, OrderType, RunStatus, Side,
    };
    use fanout_journal::{Journal, MemoryJournal, NewEvent};
    use serde_json::Value;
    use uuid::Uuid;

    fn ledger_with_trades() -> PortfolioLedger {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let buy = Order {
            id: Uuid::new_v4(),
            account_id: account,
            strategy_id: None,
            run_id: None,
            broker_order_id: None,
            symbol: "NIFTY24AUGFUT".into(),
            side: Side::Buy,
            quantity: 100,
            order_type: OrderType::Market,
            price: None,
            take_profit: None,
            stop_loss: None,
            state: OrderState::Accepted,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let sell = Order {
            id: Uuid::new_v4(),
            side: Side::Sell,
            ..buy.clone()
        };
        ledger.record_order(buy.clone());
        ledger.record_order(sell.clone());
        ledger
            .apply_fill(buy.id, 100, Decimal::from(200), Utc::now())
            .unwrap();
        ledger
            .apply_fill(sell.id, 100, Decimal::from(207), Utc::now())
            .unwrap();
        ledger
    }

    fn journal_with_events(user_id: UserId) -> MemoryJournal {
        let journal = MemoryJournal::new();
        let run = ExecutionRun {
            id: Uuid::new_v4(),
            user_id,
            group_id: Some(Uuid::new_v4()),
            strategy_run_id: None,
            status: RunStatus::Succeeded,
            requested_at: Utc::now(),
            completed_at: Some(Utc::now()),
            payload: Value::Null,
            latency: None,
        };
        journal.insert_run(&run).unwrap();
        for latency in [10.0, 20.0, 30.0, 40.0] {
            journal
                .append_event(
                    run.id,
                    NewEvent {
                        latency_ms: Some(latency),
                        completed_at: Some(Utc::now()),
                        ..NewEvent::status_only(LegStatus::Filled)
                    },
                )
                .unwrap();
        }
        journal
            .append_event(run.id, NewEvent::status_only(LegStatus::Rejected))
            .unwrap();
        journal
    }

    #[test]
    fn summary_counts_runs_legs_and_pnl() {
        let user_id = Uuid::new_v4();
        let ledger = ledger_with_trades();
        let journal = Arc::new(journal_with_events(user_id));
        let analytics = AnalyticsService::new(journal);

        let summary = analytics.summary(user_id, &ledger).unwrap();
        assert_eq!(summary.realized_pnl, Decimal::from(700));
        assert_eq!(summary.total_trades, 2);
        assert_eq!(summary.execution_run_count, 1);
        assert_eq!(summary.failed_execution_runs, 0);
        assert_eq!(summary.leg_status_counts["filled"], 4);
        assert_eq!(summary.leg_status_counts["rejected"], 1);
        assert_eq!(summary.p50_execution_latency_ms, Some(25.0));
    }

    #[test]
    fn daily_pnl_series_is_ascending_and_today_carries_unrealized() {
        let ledger = ledger_with_trades();
        let analytics = AnalyticsService::new(Arc::new(MemoryJournal::new()));
        let points = analytics.daily_pnl(&ledger, 7);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].realized_pnl, Decimal::from(700));
        assert_eq!(points[0].trade_count, 2);
    }

    #[test]
    fn daily_pnl_csv_has_documented_columns() {
        let ledger = ledger_with_trades();
        let analytics = AnalyticsService::new(Arc::new(MemoryJournal::new()));
        let csv = analytics
            .daily_pnl_csv(&analytics.daily_pnl(&ledger, 7))
            .unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("date,realized_pnl,unrealized_pnl,trade_count")
        );
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn latency_export_matches_percentiles() {
        let user_id = Uuid::new_v4();
        let journal = Arc::new(journal_with_events(user_id));
        let analytics = AnalyticsService::new(journal);
        let export = analytics.latency_export(user_id).unwrap().unwrap();
        assert_eq!(export.count, 4);
        assert_eq!(export.average_ms, 25.0);
        assert_eq!(export.max_ms, 40.0);
        assert_eq!(export.p50_ms, 25.0);

        let csv = analytics.latency_csv(&export).unwrap();
        assert!(csv.starts_with("count,average_ms,max_ms,p50_ms,p95_ms"));
    }

    #[test]
    fn empty_journal_yields_no_latency_export() {
        let analytics = AnalyticsService::new(Arc::new(MemoryJournal::new()));
        assert!(analytics.latency_export(Uuid::new_v4()).unwrap().is_none());
    }
}
