//! Error taxonomy of the service layer and its mapping onto the wire
//! envelope.

use serde_json::json;

use fanout_analytics::AnalyticsError;
use fanout_broker::BrokerError;
use fanout_core::wire::{ErrorCode, ErrorEnvelope};
use fanout_core::StrategyRunId;
use fanout_execution::ExecutionError;
use fanout_journal::JournalError;
use fanout_portfolio::LedgerError;
use fanout_rms::RmsViolation;
use fanout_scheduler::{SchedulerError, WebhookError};
use fanout_strategy::StrategyError;
use fanout_vault::VaultError;

/// Result alias for service-layer operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified service-layer error; every variant maps to one envelope code.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Rms(#[from] RmsViolation),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("webhook token not recognised")]
    WebhookUnauthorized,
    #[error("duplicate webhook delivery")]
    DuplicateDelivery { existing: StrategyRunId },
    #[error("{0}")]
    WebhookFailed(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("not authorized to access this {0}")]
    Unauthorized(&'static str),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<WebhookError> for CoreError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::UnknownToken | WebhookError::Disabled => Self::WebhookUnauthorized,
            WebhookError::Duplicate { existing } => Self::DuplicateDelivery { existing },
            WebhookError::Transform(msg) => Self::Validation(msg),
            WebhookError::Trigger(msg) => Self::WebhookFailed(msg),
        }
    }
}

impl CoreError {
    /// Envelope code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Rms(violation) => match violation {
                RmsViolation::MaxOrderLots { .. } | RmsViolation::MaxDailyLots { .. } => {
                    ErrorCode::RmsMaxLots
                }
                RmsViolation::DailyLossTripped { .. } => ErrorCode::RmsMaxLoss,
                RmsViolation::ExposureLimit { .. } => ErrorCode::RmsExposure,
                RmsViolation::MarginBuffer { .. } => ErrorCode::RmsMargin,
            },
            Self::Broker(err) => match err {
                BrokerError::SessionExpired | BrokerError::Authentication(_) => {
                    ErrorCode::BrokerSessionExpired
                }
                BrokerError::Rejected(_) => ErrorCode::BrokerRejected,
                BrokerError::Timeout => ErrorCode::AdapterTimeout,
                BrokerError::InvalidRequest(_) => ErrorCode::Validation,
                _ => ErrorCode::Internal,
            },
            Self::Execution(err) => match err {
                ExecutionError::NoEligibleAccounts => ErrorCode::NoEligibleAccounts,
                ExecutionError::AllocationInvalid(_) => ErrorCode::AllocationInvalid,
                ExecutionError::Validation(_) => ErrorCode::Validation,
                _ => ErrorCode::Internal,
            },
            Self::Strategy(err) => match err {
                StrategyError::NotFound => ErrorCode::NotFound,
                StrategyError::Stopped => ErrorCode::Conflict,
                StrategyError::InvalidParams(_) => ErrorCode::Validation,
                _ => ErrorCode::Internal,
            },
            Self::Journal(_) | Self::Ledger(_) | Self::Analytics(_) => ErrorCode::Internal,
            Self::Vault(VaultError::NotFound) => ErrorCode::NotFound,
            Self::Vault(_) => ErrorCode::Internal,
            Self::Scheduler(SchedulerError::NotFound) => ErrorCode::NotFound,
            Self::Scheduler(_) => ErrorCode::Validation,
            Self::WebhookUnauthorized => ErrorCode::Unauthorized,
            Self::DuplicateDelivery { .. } => ErrorCode::Conflict,
            Self::WebhookFailed(_) => ErrorCode::Internal,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Validation(_) => ErrorCode::Validation,
        }
    }

    /// Wire-shaped `{error: {code, message, details?}}` for this error.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        let envelope = ErrorEnvelope::new(self.code(), self.to_string());
        match self {
            Self::DuplicateDelivery { existing } => {
                envelope.with_details(json!({ "strategy_run_id": existing }))
            }
            Self::Rms(violation) => envelope.with_details(json!({ "rule": violation.rule() })),
            _ => envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn rms_violations_map_to_rms_codes() {
        let err = CoreError::Rms(RmsViolation::MaxDailyLots {
            used: 5,
            requested: 1,
            limit: 5,
        });
        assert_eq!(err.code(), ErrorCode::RmsMaxLots);
        let envelope = err.envelope();
        assert_eq!(envelope.error.details.unwrap()["rule"], "max_daily_lots");
    }

    #[test]
    fn duplicate_delivery_is_a_conflict_with_run_id() {
        let existing = Uuid::new_v4();
        let err = CoreError::DuplicateDelivery { existing };
        assert_eq!(err.code(), ErrorCode::Conflict);
        let details = err.envelope().error.details.unwrap();
        assert_eq!(details["strategy_run_id"], json!(existing));
    }

    #[test]
    fn broker_errors_map_to_documented_codes() {
        assert_eq!(
            CoreError::Broker(BrokerError::Timeout).code(),
            ErrorCode::AdapterTimeout
        );
        assert_eq!(
            CoreError::Broker(BrokerError::SessionExpired).code(),
            ErrorCode::BrokerSessionExpired
        );
        assert_eq!(
            CoreError::Broker(BrokerError::Rejected("no margin".into())).code(),
            ErrorCode::BrokerRejected
        );
    }

    #[test]
    fn planner_errors_map_to_allocation_codes() {
        assert_eq!(
            CoreError::Execution(ExecutionError::NoEligibleAccounts).code(),
            ErrorCode::NoEligibleAccounts
        );
        assert_eq!(
            CoreError::Execution(ExecutionError::AllocationInvalid("x".into())).code(),
            ErrorCode::AllocationInvalid
        );
    }
}
