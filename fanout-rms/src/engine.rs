//! The gate itself: counter bookkeeping under a per-user lock.
//!
//! Broker I/O never happens while a counter lock is held; accepted legs
//! take a [`Reservation`] which the orchestrator later commits or releases
//! depending on the leg outcome, so partial failures restore the counters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use fanout_core::UserId;

use crate::{AuditLog, EnforcementAction, RmsConfig, RmsResult, RmsStatus, RmsViolation};

/// Mutable per-(user, trading day) counters. Reset at the exchange-timezone
/// day boundary.
#[derive(Clone, Debug)]
pub struct DayCounters {
    pub day: NaiveDate,
    pub lots_committed: u32,
    pub reserved_lots: u32,
    pub realized_pnl: Decimal,
    pub open_notional: Decimal,
    pub reserved_notional: Decimal,
    pub peak_pnl: Decimal,
}

impl DayCounters {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            day,
            lots_committed: 0,
            reserved_lots: 0,
            realized_pnl: Decimal::ZERO,
            open_notional: Decimal::ZERO,
            reserved_notional: Decimal::ZERO,
            peak_pnl: Decimal::ZERO,
        }
    }

    fn lots_in_flight(&self) -> u32 {
        self.lots_committed + self.reserved_lots
    }

    fn notional_in_flight(&self) -> Decimal {
        self.open_notional + self.reserved_notional
    }
}

/// Lots and notional held against the daily counters for one accepted leg.
#[derive(Debug)]
pub struct Reservation {
    pub user_id: UserId,
    pub day: NaiveDate,
    pub lots: u32,
    pub notional: Decimal,
}

/// Everything the gate needs to know about one prospective leg.
#[derive(Clone, Copy, Debug)]
pub struct LegCheck {
    pub lots: u32,
    pub lot_size: u32,
    pub ref_price: Decimal,
    pub margin_available: Decimal,
}

impl LegCheck {
    fn notional(&self) -> Decimal {
        Decimal::from(self.lots) * Decimal::from(self.lot_size) * self.ref_price
    }
}

/// Risk engine owning configs, counters, and the audit log.
///
/// Counter mutations for one user are serialised by that user's lock;
/// distinct users proceed independently.
pub struct RmsEngine {
    tz: FixedOffset,
    configs: RwLock<HashMap<UserId, RmsConfig>>,
    counters: Mutex<HashMap<UserId, Arc<Mutex<DayCounters>>>>,
    audit: Arc<AuditLog>,
}

impl RmsEngine {
    /// `tz` is the exchange timezone used for the daily rollover.
    pub fn new(tz: FixedOffset, audit: Arc<AuditLog>) -> Self {
        Self {
            tz,
            configs: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn set_config(&self, user_id: UserId, config: RmsConfig) {
        self.configs.write().insert(user_id, config);
    }

    #[must_use]
    pub fn config(&self, user_id: UserId) -> RmsConfig {
        self.configs.read().get(&user_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    /// Users with an explicit risk configuration (the enforcement sweep
    /// iterates these).
    #[must_use]
    pub fn configured_users(&self) -> Vec<UserId> {
        self.configs.read().keys().copied().collect()
    }

    /// Today's date in the configured exchange timezone.
    #[must_use]
    pub fn trading_day(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    fn user_counters(&self, user_id: UserId) -> Arc<Mutex<DayCounters>> {
        let mut map = self.counters.lock();
        Arc::clone(
            map.entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(DayCounters::fresh(self.trading_day())))),
        )
    }

    fn roll_day(&self, user_id: UserId, counters: &mut DayCounters) {
        let today = self.trading_day();
        if counters.day != today {
            self.audit.record(
                user_id,
                "day_rollover",
                format!(
                    "counters reset for {today} (exchange offset {})",
                    self.tz
                ),
                json!({ "previous_day": counters.day, "offset": self.tz.to_string() }),
            );
            *counters = DayCounters::fresh(today);
        }
    }

    /// Pre-trade gate for one leg. On acceptance the leg's lots and notional
    /// are reserved; the caller must later [`commit`](Self::commit) or
    /// [`release`](Self::release) the reservation.
    pub fn pre_trade(&self, user_id: UserId, leg: &LegCheck) -> RmsResult<Reservation> {
        let config = self.config(user_id);
        let cell = self.user_counters(user_id);
        let mut counters = cell.lock();
        self.roll_day(user_id, &mut counters);

        if let Some(limit) = config.max_lots_per_order {
            if leg.lots > limit {
                return Err(RmsViolation::MaxOrderLots {
                    lots: leg.lots,
                    limit,
                });
            }
        }

        if let Some(limit) = config.max_daily_lots {
            let used = counters.lots_in_flight();
            if used + leg.lots > limit {
                return Err(RmsViolation::MaxDailyLots {
                    used,
                    requested: leg.lots,
                    limit,
                });
            }
        }

        let notional = leg.notional();
        if let Some(limit) = config.exposure_limit {
            let projected = counters.notional_in_flight() + notional;
            if projected > limit {
                return Err(RmsViolation::ExposureLimit { projected, limit });
            }
        }

        if let Some(buffer_pct) = config.margin_buffer_pct {
            let required = notional * (Decimal::ONE + buffer_pct / Decimal::from(100));
            if leg.margin_available < required {
                return Err(RmsViolation::MarginBuffer {
                    required,
                    available: leg.margin_available,
                });
            }
        }

        if let Some(limit) = config.max_daily_loss {
            if counters.realized_pnl <= -limit {
                return Err(RmsViolation::DailyLossTripped {
                    pnl: counters.realized_pnl,
                    limit,
                });
            }
        }

        counters.reserved_lots += leg.lots;
        counters.reserved_notional += notional;
        Ok(Reservation {
            user_id,
            day: counters.day,
            lots: leg.lots,
            notional,
        })
    }

    /// Leg reached accepted/filled: move the reservation into the committed
    /// counters.
    pub fn commit(&self, reservation: Reservation) {
        let cell = self.user_counters(reservation.user_id);
        let mut counters = cell.lock();
        if counters.day != reservation.day {
            debug!(user_id = %reservation.user_id, "reservation commit crossed a day boundary; dropped");
            return;
        }
        counters.reserved_lots = counters.reserved_lots.saturating_sub(reservation.lots);
        counters.reserved_notional -= reservation.notional;
        counters.lots_committed += reservation.lots;
        counters.open_notional += reservation.notional;
    }

    /// Leg rejected or errored: hand the reserved capacity back.
    pub fn release(&self, reservation: Reservation) {
        let cell = self.user_counters(reservation.user_id);
        let mut counters = cell.lock();
        if counters.day != reservation.day {
            return;
        }
        counters.reserved_lots = counters.reserved_lots.saturating_sub(reservation.lots);
        counters.reserved_notional -= reservation.notional;
    }

    /// Fold a realised PnL delta (from a trade) into today's counters.
    pub fn record_realized(&self, user_id: UserId, delta: Decimal) {
        let cell = self.user_counters(user_id);
        let mut counters = cell.lock();
        self.roll_day(user_id, &mut counters);
        counters.realized_pnl += delta;
        if counters.realized_pnl > counters.peak_pnl {
            counters.peak_pnl = counters.realized_pnl;
        }
    }

    /// Reduce open notional when positions are closed.
    pub fn reduce_exposure(&self, user_id: UserId, amount: Decimal) {
        let cell = self.user_counters(user_id);
        let mut counters = cell.lock();
        counters.open_notional = (counters.open_notional - amount).max(Decimal::ZERO);
    }

    /// Snapshot of the current counters (test and status helper).
    #[must_use]
    pub fn counters_snapshot(&self, user_id: UserId) -> DayCounters {
        let cell = self.user_counters(user_id);
        let mut counters = cell.lock();
        self.roll_day(user_id, &mut counters);
        counters.clone()
    }

    /// Status read model with near-limit alerts.
    #[must_use]
    pub fn status(&self, user_id: UserId) -> RmsStatus {
        let config = self.config(user_id);
        let counters = self.counters_snapshot(user_id);
        let mut alerts = Vec::new();

        let lots_remaining = config.max_daily_lots.map(|limit| {
            let remaining = limit.saturating_sub(counters.lots_in_flight());
            if remaining <= (limit / 10).max(1) {
                alerts.push("Daily lot limit is nearly exhausted".to_string());
            }
            remaining
        });
        let loss_remaining = config.max_daily_loss.map(|limit| {
            if counters.realized_pnl <= -limit * Decimal::new(8, 1) {
                alerts.push("Daily loss approaching limit".to_string());
            }
            (limit + counters.realized_pnl).max(Decimal::ZERO)
        });
        if let Some(limit) = config.exposure_limit {
            if counters.notional_in_flight() >= limit * Decimal::new(9, 1) {
                alerts.push("Exposure near configured limit".to_string());
            }
        }

        let automations = self
            .pending_actions(&config, &counters)
            .into_iter()
            .map(|action| match action {
                EnforcementAction::SquareOff { message, .. } => message,
                EnforcementAction::TightenTrailingStop { delta } => {
                    format!("Trailing stop tightening queued (delta {delta})")
                }
                EnforcementAction::Hedge { message, .. } => message,
            })
            .collect();

        RmsStatus {
            trading_day: counters.day,
            day_pnl: counters.realized_pnl,
            lots_used: counters.lots_in_flight(),
            lots_remaining,
            max_daily_lots: config.max_daily_lots,
            max_daily_loss: config.max_daily_loss,
            loss_remaining,
            notional_exposure: counters.notional_in_flight(),
            exposure_limit: config.exposure_limit,
            alerts,
            automations,
        }
    }

    /// In-trade enforcement sweep. Emits the actions that should run and
    /// audits each one; executing them is the caller's job.
    pub fn enforce(&self, user_id: UserId) -> Vec<EnforcementAction> {
        let config = self.config(user_id);
        let counters = self.counters_snapshot(user_id);
        let actions = self.pending_actions(&config, &counters);
        for action in &actions {
            let (rule, message) = match action {
                EnforcementAction::SquareOff { rule, message } => (rule.clone(), message.clone()),
                EnforcementAction::TightenTrailingStop { delta } => (
                    "profit_lock".to_string(),
                    format!("trailing stop tightened by {delta}"),
                ),
                EnforcementAction::Hedge { message, .. } => ("auto_hedge".to_string(), message.clone()),
            };
            self.audit.record(
                user_id,
                &rule,
                message,
                json!({
                    "day": counters.day,
                    "realized_pnl": counters.realized_pnl,
                    "peak_pnl": counters.peak_pnl,
                    "lots": counters.lots_in_flight(),
                    "notional": counters.notional_in_flight(),
                }),
            );
            self.notify(user_id, &config, action);
        }
        actions
    }

    fn pending_actions(&self, config: &RmsConfig, counters: &DayCounters) -> Vec<EnforcementAction> {
        let mut actions = Vec::new();

        if config.auto_square_off_enabled {
            if let Some(limit) = config.max_daily_loss {
                let buffer = config
                    .auto_square_off_buffer_pct
                    .unwrap_or(Decimal::ZERO)
                    .clamp(Decimal::ZERO, Decimal::from(100));
                let trigger = -limit * (Decimal::ONE - buffer / Decimal::from(100));
                if counters.realized_pnl <= trigger {
                    actions.push(EnforcementAction::SquareOff {
                        rule: "max_daily_loss".into(),
                        message: format!(
                            "Auto square-off triggered: day PnL {} breached loss limit {}",
                            counters.realized_pnl,
                            trigger.abs()
                        ),
                    });
                }
            }
        }

        if let Some(profit_lock) = config.profit_lock {
            if counters.realized_pnl >= profit_lock {
                let delta = config.trailing_sl.unwrap_or(Decimal::ZERO);
                actions.push(EnforcementAction::TightenTrailingStop { delta });
            }
        }

        if let Some(drawdown) = config.drawdown_limit {
            let give_back = counters.peak_pnl - counters.realized_pnl;
            if counters.peak_pnl > Decimal::ZERO && give_back >= drawdown {
                actions.push(EnforcementAction::SquareOff {
                    rule: "drawdown_limit".into(),
                    message: format!(
                        "Auto square-off triggered: drawdown {give_back} from session peak {} breached limit {drawdown}",
                        counters.peak_pnl
                    ),
                });
            }
        }

        if config.auto_hedge_enabled {
            if let Some(limit) = config.exposure_limit {
                let exposure = counters.notional_in_flight();
                if exposure >= limit * Decimal::new(9, 1) {
                    let ratio = config.auto_hedge_ratio.unwrap_or(Decimal::ONE);
                    actions.push(EnforcementAction::Hedge {
                        ratio,
                        message: format!(
                            "Auto hedge triggered: exposure {exposure} within 10% of limit {limit}"
                        ),
                    });
                }
            }
        }

        actions
    }

    fn notify(&self, user_id: UserId, config: &RmsConfig, action: &EnforcementAction) {
        let detail = match action {
            EnforcementAction::SquareOff { message, .. } => message,
            EnforcementAction::Hedge { message, .. } => message,
            EnforcementAction::TightenTrailingStop { .. } => return,
        };
        for channel in [
            config.notify_email.then_some("email"),
            config.notify_telegram.then_some("telegram"),
        ]
        .into_iter()
        .flatten()
        {
            self.audit.record(
                user_id,
                "notification",
                format!("Notification queued via {channel}: {detail}"),
                serde_json::Value::Null,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn engine() -> RmsEngine {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        RmsEngine::new(offset, Arc::new(AuditLog::new()))
    }

    fn leg(lots: u32) -> LegCheck {
        LegCheck {
            lots,
            lot_size: 1,
            ref_price: Decimal::from(100),
            margin_available: Decimal::from(1_000_000),
        }
    }

    #[test]
    fn daily_lot_limit_counts_reservations() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                max_daily_lots: Some(5),
                ..RmsConfig::default()
            },
        );

        // Seed four committed lots, then gate three one-lot legs.
        let seed = rms.pre_trade(user, &leg(4)).unwrap();
        rms.commit(seed);

        let first = rms.pre_trade(user, &leg(1));
        assert!(first.is_ok());
        let second = rms.pre_trade(user, &leg(1));
        assert_eq!(
            second.unwrap_err(),
            RmsViolation::MaxDailyLots {
                used: 5,
                requested: 1,
                limit: 5
            }
        );
    }

    #[test]
    fn released_reservation_restores_capacity() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                max_daily_lots: Some(2),
                ..RmsConfig::default()
            },
        );

        let reservation = rms.pre_trade(user, &leg(2)).unwrap();
        assert!(rms.pre_trade(user, &leg(1)).is_err());
        rms.release(reservation);
        assert!(rms.pre_trade(user, &leg(2)).is_ok());
    }

    #[test]
    fn commit_moves_reservation_to_committed() {
        let rms = engine();
        let user = Uuid::new_v4();
        let reservation = rms.pre_trade(user, &leg(3)).unwrap();
        rms.commit(reservation);
        let counters = rms.counters_snapshot(user);
        assert_eq!(counters.lots_committed, 3);
        assert_eq!(counters.reserved_lots, 0);
        assert_eq!(counters.open_notional, Decimal::from(300));
        assert_eq!(counters.reserved_notional, Decimal::ZERO);
    }

    #[test]
    fn per_order_limit_applies_before_daily_limit() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                max_lots_per_order: Some(2),
                max_daily_lots: Some(100),
                ..RmsConfig::default()
            },
        );
        assert_eq!(
            rms.pre_trade(user, &leg(3)).unwrap_err(),
            RmsViolation::MaxOrderLots { lots: 3, limit: 2 }
        );
    }

    #[test]
    fn exposure_projection_includes_reservations() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                exposure_limit: Some(Decimal::from(250)),
                ..RmsConfig::default()
            },
        );
        let held = rms.pre_trade(user, &leg(2)).unwrap(); // 200 notional
        assert!(matches!(
            rms.pre_trade(user, &leg(1)).unwrap_err(), // projected 300
            RmsViolation::ExposureLimit { .. }
        ));
        rms.release(held);
    }

    #[test]
    fn margin_buffer_requires_headroom() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                margin_buffer_pct: Some(Decimal::from(10)),
                ..RmsConfig::default()
            },
        );
        let mut short = leg(1);
        short.margin_available = Decimal::from(105); // required 110
        assert!(matches!(
            rms.pre_trade(user, &short).unwrap_err(),
            RmsViolation::MarginBuffer { .. }
        ));
    }

    #[test]
    fn tripped_daily_loss_blocks_new_orders() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                max_daily_loss: Some(Decimal::from(500)),
                ..RmsConfig::default()
            },
        );
        rms.record_realized(user, Decimal::from(-600));
        assert!(matches!(
            rms.pre_trade(user, &leg(1)).unwrap_err(),
            RmsViolation::DailyLossTripped { .. }
        ));
    }

    #[test]
    fn enforcement_square_off_fires_inside_buffer() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                max_daily_loss: Some(Decimal::from(1000)),
                auto_square_off_enabled: true,
                auto_square_off_buffer_pct: Some(Decimal::from(10)),
                ..RmsConfig::default()
            },
        );
        // Trigger point is -900 with the 10% buffer.
        rms.record_realized(user, Decimal::from(-850));
        assert!(rms.enforce(user).is_empty());
        rms.record_realized(user, Decimal::from(-60));
        let actions = rms.enforce(user);
        assert!(matches!(
            actions.first(),
            Some(EnforcementAction::SquareOff { rule, .. }) if rule == "max_daily_loss"
        ));
        assert!(!rms.audit_log().for_user(user).is_empty());
    }

    #[test]
    fn drawdown_from_peak_triggers_square_off() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                drawdown_limit: Some(Decimal::from(300)),
                ..RmsConfig::default()
            },
        );
        rms.record_realized(user, Decimal::from(500)); // peak 500
        rms.record_realized(user, Decimal::from(-350)); // now 150, give-back 350
        let actions = rms.enforce(user);
        assert!(matches!(
            actions.first(),
            Some(EnforcementAction::SquareOff { rule, .. }) if rule == "drawdown_limit"
        ));
    }

    #[test]
    fn profit_lock_tightens_trailing_stop() {
        let rms = engine();
        let user = Uuid::new_v4();
        rms.set_config(
            user,
            RmsConfig {
                profit_lock: Some(Decimal::from(1000)),
                trailing_sl: Some(Decimal::from(50)),
                ..RmsConfig::default()
            },
        );
        rms.record_realized(user, Decimal::from(1200));
        let actions = rms.enforce(user);
        assert_eq!(
            actions,
            vec![EnforcementAction::TightenTrailingStop {
                delta: Decimal::from(50)
            }]
        );
    }

    #[test]
    fn users_do_not_share_counters() {
        let rms = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        rms.set_config(
            a,
            RmsConfig {
                max_daily_lots: Some(1),
                ..RmsConfig::default()
            },
        );
        let held = rms.pre_trade(a, &leg(1)).unwrap();
        assert!(rms.pre_trade(b, &leg(10)).is_ok());
        rms.release(held);
    }
}
