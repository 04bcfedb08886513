//! Sequence and stock consistency engine.
//!
//! - [`SequenceGenerator`] issues per-tenant document codes such as
//!   `INV-00001` that are never handed out twice.
//! - [`StockLedger`] applies the stock effect of bills, invoices and
//!   production orders, including net-delta edits and deletion reversals.
//! - [`TransactionCoordinator`] runs each [`UnitOfWork`] in one store
//!   transaction and retries transient conflicts.
//! - [`LedgerService`] ties them together into document use cases.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod sequence;
pub mod service;
pub mod stock;
pub mod telemetry;

pub use config::LedgerConfig;
pub use coordinator::{RetryPolicy, TransactionCoordinator, UnitOfWork};
pub use error::{LedgerError, Result};
pub use sequence::{
    CounterStats, MAX_CODE_ATTEMPTS, ResetOutcome, SequenceConfig, SequenceGenerator, format_code,
    sequence_config,
};
pub use service::LedgerService;
pub use stock::{Direction, StockEffect, StockFloorPolicy, StockLedger};
pub use telemetry::{LogFormat, init_tracing, try_init_tracing};
