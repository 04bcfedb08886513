//! Transactional storage for the ledger engine.
//!
//! Three kinds of rows live here: per-tenant sequence counters, item stock
//! levels (with their movement history) and documents. Every mutation goes
//! through an explicit transaction handle obtained from
//! [`TransactionalStore::begin`], so one logical operation can update all
//! three atomically. Two backends are provided: [`InMemoryLedgerStore`] and
//! [`PostgresLedgerStore`].

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;
pub mod tx;

pub use error::{Result, StoreError};
pub use memory::{InMemoryLedgerStore, InMemoryTx};
pub use model::{
    Counter, Document, DocumentBody, Item, MovementReason, StockAdjustment, StockFloor,
    StockMovement, StockSummary,
};
pub use postgres::{PostgresLedgerStore, PostgresTx};
pub use store::{
    DocumentStore, LedgerStore, SequenceStore, StockStore, Transaction, TransactionalStore,
};
pub use tx::{TxId, TxState};
