//! Fan-out execution: deterministic lot allocation and the per-run
//! orchestrator state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use fanout_broker::{BrokerFleet, BrokerResult, OrderCommand, Placement};
use fanout_core::{AccountId, DomainError, LinkId, Price};
use fanout_journal::JournalError;

mod orchestrator;
mod planner;

pub use orchestrator::{Orchestrator, RunReport};
pub use planner::plan_allocation;

/// Result alias for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Failures that abort a run before or during orchestration.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution group has no accounts to allocate orders")]
    NoEligibleAccounts,
    #[error("allocation invalid: {0}")]
    AllocationInvalid(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("internal execution error: {0}")]
    Internal(String),
}

impl From<DomainError> for ExecutionError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Cooperative cancellation signal for one run. Checked before every
/// not-yet-dispatched leg; a leg already on the wire is never interrupted.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Tunables for the orchestrator.
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently dispatched legs within one run.
    pub worker_pool: usize,
    /// Overall deadline for a parallel run.
    pub run_deadline_parallel: Duration,
    /// Overall deadline for a staggered run.
    pub run_deadline_staggered: Duration,
    /// Inter-leg release delay in staggered mode.
    pub stagger_delay: Duration,
    /// In staggered mode, cancel not-yet-released legs once this many
    /// earlier legs have failed. `None` disables the threshold.
    pub stagger_abort_threshold: Option<u32>,
    /// Roll back already-successful legs when a sync run ends Partial.
    /// The rollback itself is bounded by the run deadline.
    pub rollback_on_partial: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_pool: 8,
            run_deadline_parallel: Duration::from_secs(30),
            run_deadline_staggered: Duration::from_secs(60),
            stagger_delay: Duration::from_millis(250),
            stagger_abort_threshold: None,
            rollback_on_partial: false,
        }
    }
}

/// Everything the orchestrator needs from the broker layer, keyed by
/// account. Implemented by [`BrokerFleet`]; tests substitute mocks.
#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn place(&self, account_id: AccountId, command: &OrderCommand)
        -> BrokerResult<Placement>;

    async fn cancel(&self, account_id: AccountId, broker_order_id: &str) -> BrokerResult<()>;

    /// Available margin for the RMS margin check.
    async fn margin_available(&self, account_id: AccountId) -> BrokerResult<Decimal>;

    /// Reference price for the RMS notional projection.
    async fn reference_price(&self, account_id: AccountId, symbol: &str) -> BrokerResult<Price>;

    /// Broker link serving the account, when known.
    fn link_for(&self, account_id: AccountId) -> Option<LinkId>;
}

#[async_trait]
impl AccountGateway for BrokerFleet {
    async fn place(
        &self,
        account_id: AccountId,
        command: &OrderCommand,
    ) -> BrokerResult<Placement> {
        let (connection, _) = self.connection_for_account(account_id)?;
        connection.place(command).await
    }

    async fn cancel(&self, account_id: AccountId, broker_order_id: &str) -> BrokerResult<()> {
        let (connection, _) = self.connection_for_account(account_id)?;
        connection.cancel(broker_order_id).await
    }

    async fn margin_available(&self, account_id: AccountId) -> BrokerResult<Decimal> {
        // Prefer a live snapshot; fall back to the cached account value when
        // the broker is unreachable.
        match self.refresh_margin(account_id).await {
            Ok(snapshot) => Ok(snapshot.available),
            Err(_) => Ok(self.account(account_id)?.margin_available),
        }
    }

    async fn reference_price(&self, account_id: AccountId, symbol: &str) -> BrokerResult<Price> {
        let (connection, _) = self.connection_for_account(account_id)?;
        connection.last_price(symbol).await
    }

    fn link_for(&self, account_id: AccountId) -> Option<LinkId> {
        self.account(account_id).ok().map(|account| account.link_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_sticky() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.trigger();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
