use async_trait::async_trait;
use common::{DocumentId, DocumentType, ItemId, TenantId};

use crate::{
    Counter, Document, Item, Result, StockAdjustment, StockMovement, StockSummary,
    tx::{TxId, TxState},
};

/// A transaction handle. Every mutating store call takes one explicitly;
/// there is no ambient "current session".
pub trait Transaction: Send {
    fn id(&self) -> TxId;

    fn state(&self) -> TxState;
}

/// A store that can open, commit and abort transactions.
///
/// Handles are created `Active` by [`begin`](Self::begin) and end up
/// `Committed` or `Aborted`. A handle never opens another transaction, so
/// nesting is impossible: everything in one logical operation shares one
/// handle.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Makes every write done through `tx` visible atomically.
    ///
    /// May fail with `TransientConflict`, in which case nothing was applied.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Discards every write done through `tx`.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

/// Persistent per-(tenant, document type) counters.
#[async_trait]
pub trait SequenceStore: TransactionalStore {
    /// Atomically increments the counter, creating it at 1 if absent, and
    /// returns the new value.
    ///
    /// Concurrent callers on the same key observe disjoint, increasing
    /// values. An increment made by a transaction that later aborts is
    /// discarded with it.
    async fn increment_and_get(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
    ) -> Result<i64>;

    /// Returns the last committed value, or 0 if the counter does not exist.
    async fn peek(&self, tenant_id: TenantId, document_type: DocumentType) -> Result<i64>;

    /// Overwrites the counter (creating it if needed).
    ///
    /// Administrative escape hatch: not serialized against
    /// [`increment_and_get`](Self::increment_and_get).
    async fn reset(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
        sequence: i64,
    ) -> Result<()>;

    /// All counters of a tenant.
    async fn list_counters(&self, tenant_id: TenantId) -> Result<Vec<Counter>>;
}

/// Per-(tenant, item) available quantity, mutated only through
/// [`adjust`](Self::adjust).
#[async_trait]
pub trait StockStore: TransactionalStore {
    /// Seeds an item row on behalf of the item master. Opening stock is
    /// taken from `item.available_stock`.
    async fn insert_item(&self, tx: &mut Self::Tx, item: &Item) -> Result<()>;

    /// Reads the item, applies the delta, writes it back and records a
    /// movement, all through `tx`. Returns the new available stock.
    ///
    /// Fails with `ItemNotFound` if the item does not resolve under the
    /// tenant, and with `InsufficientStock` if the floor is enforced and the
    /// result would be negative.
    async fn adjust(&self, tx: &mut Self::Tx, adjustment: StockAdjustment) -> Result<i64>;

    async fn get_item(&self, tenant_id: TenantId, item_id: ItemId) -> Result<Option<Item>>;

    /// Committed available stock of an item.
    async fn available_stock(&self, tenant_id: TenantId, item_id: ItemId) -> Result<i64>;

    /// Active items at or below their reorder level, ordered by name.
    async fn list_low_stock(&self, tenant_id: TenantId) -> Result<Vec<Item>>;

    async fn stock_summary(&self, tenant_id: TenantId) -> Result<StockSummary>;

    /// Movement history of an item, oldest first.
    async fn list_movements(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> Result<Vec<StockMovement>>;
}

/// Bill, invoice and production-order rows.
#[async_trait]
pub trait DocumentStore: TransactionalStore {
    /// Inserts a new document. Fails with `DuplicateDocumentCode` if a
    /// document of the same tenant and type already carries the code.
    async fn insert_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()>;

    /// Loads a live (not deleted) document for update, locking it until the
    /// transaction ends.
    async fn load_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Document>;

    /// Replaces the body of an existing document.
    async fn update_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()>;

    /// Soft-deletes a live document.
    async fn delete_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()>;

    /// Returns true if any document (deleted or not) of the tenant and type
    /// already carries `code`.
    async fn code_exists(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        code: &str,
    ) -> Result<bool>;

    /// Committed read of a document, including soft-deleted ones.
    async fn find_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>>;
}

/// Everything the ledger engine needs from one backend.
pub trait LedgerStore: SequenceStore + StockStore + DocumentStore {}

impl<T: SequenceStore + StockStore + DocumentStore> LedgerStore for T {}
