//! Fanout aggregate crate: re-exports the workspace and wires the service
//! layer an HTTP transport binds to.

pub use fanout_analytics as analytics;
pub use fanout_broker as broker;
pub use fanout_config as config;
pub use fanout_core as core;
pub use fanout_execution as execution;
pub use fanout_journal as journal;
pub use fanout_paper as paper;
pub use fanout_portfolio as portfolio;
pub use fanout_rms as rms;
pub use fanout_scheduler as scheduler;
pub use fanout_strategy as strategy;
pub use fanout_vault as vault;

mod api;
mod services;
mod telemetry;

pub use api::{CoreError, CoreResult};
pub use services::{CoreServices, GroupRegistry, SquareOffReport};
pub use telemetry::init_tracing;

/// Convenience prelude pulling the commonly used items into scope.
pub mod prelude {
    pub use crate::api::{CoreError, CoreResult};
    pub use crate::services::CoreServices;
    pub use fanout_broker::{AdapterRegistry, BrokerFleet};
    pub use fanout_config::{load_config, AppConfig};
    pub use fanout_core::wire::*;
    pub use fanout_core::*;
    pub use fanout_execution::{CancelToken, ExecutionConfig, Orchestrator};
    pub use fanout_journal::{Journal, MemoryJournal, SqliteJournal};
    pub use fanout_paper::{PaperBroker, PaperFactory};
    pub use fanout_rms::{RmsConfig, RmsEngine};
    pub use fanout_scheduler::{Scheduler, WebhookGateway};
    pub use fanout_strategy::{StrategyEngine, StrategyMode};
}
