//! Time- and event-driven strategy triggers: the cron scheduler and the
//! webhook ingress.

use async_trait::async_trait;
use serde_json::Value;

mod scheduler;
mod webhook;

pub use scheduler::{ScheduledJob, Scheduler, SchedulerError};
pub use webhook::{
    constant_time_eq, FieldMap, TransformSpec, WebhookConnector, WebhookError, WebhookGateway,
    WebhookOutcome,
};

use fanout_core::{StrategyId, StrategyRunId, UserId};

/// Downstream hook fired by both the scheduler and the webhook gateway.
/// The facade implements this by starting a strategy run.
#[async_trait]
pub trait StrategyTrigger: Send + Sync {
    async fn trigger(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        context: Value,
    ) -> Result<StrategyRunId, String>;
}
