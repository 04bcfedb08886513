use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{DocumentId, DocumentType, ItemId, TenantId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    Counter, Document, Item, Result, StockAdjustment, StockFloor, StockMovement, StockStore,
    StockSummary, StoreError,
    store::{DocumentStore, SequenceStore, Transaction, TransactionalStore},
    tx::{TxId, TxState, TxStatus},
};

/// How long a transaction waits for a row lock before giving up with
/// `TransientConflict`.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

type CounterKey = (TenantId, DocumentType);
type ItemKey = (TenantId, ItemId);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Counter(TenantId, DocumentType),
    Item(TenantId, ItemId),
    Document(DocumentId),
    DocumentCode(TenantId, DocumentType, String),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Counter(tenant, doc_type) => write!(f, "counter {tenant}/{doc_type}"),
            RowKey::Item(tenant, item) => write!(f, "item {tenant}/{item}"),
            RowKey::Document(id) => write!(f, "document {id}"),
            RowKey::DocumentCode(tenant, doc_type, code) => {
                write!(f, "document code {tenant}/{doc_type}/{code}")
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    counters: HashMap<CounterKey, Counter>,
    items: HashMap<ItemKey, Item>,
    documents: HashMap<DocumentId, Document>,
    movements: Vec<StockMovement>,
}

struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
    failing_commits: AtomicU32,
}

/// In-memory ledger store for tests and local runs.
///
/// Committed rows live in shared tables. A transaction takes an exclusive
/// lock on every row it reads for update and holds it until it commits or
/// aborts, buffering its writes privately in the meantime. Lock waits are
/// bounded by a timeout, which doubles as deadlock detection.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryLedgerStore {
    /// Creates an empty store with the default lock timeout.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
                failing_commits: AtomicU32::new(0),
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    /// Makes the next `count` commits fail with `TransientConflict`.
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of committed documents, deleted ones included.
    pub async fn document_count(&self) -> usize {
        self.inner.tables.lock().await.documents.len()
    }

    async fn lock_row(&self, tx: &mut InMemoryTx, key: RowKey) -> Result<()> {
        if tx.guards.contains_key(&key) {
            return Ok(());
        }

        let row_lock = {
            let mut locks = self.inner.row_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };

        let guard = tokio::time::timeout(self.inner.lock_timeout, row_lock.lock_owned())
            .await
            .map_err(|_| StoreError::TransientConflict {
                reason: format!("{} timed out waiting for lock on {key}", tx.status.id()),
            })?;

        tx.guards.insert(key, guard);
        Ok(())
    }

    /// Drops the handle's row locks and forgets every lock nobody else is
    /// holding or waiting on.
    async fn release_locks(&self, tx: &mut InMemoryTx) {
        let keys: Vec<RowKey> = tx.guards.drain().map(|(key, _guard)| key).collect();
        if keys.is_empty() {
            return;
        }

        let mut locks = self.inner.row_locks.lock().await;
        for key in keys {
            if locks
                .get(&key)
                .is_some_and(|row_lock| Arc::strong_count(row_lock) == 1)
            {
                locks.remove(&key);
            }
        }
    }

    #[cfg(test)]
    async fn row_lock_count(&self) -> usize {
        self.inner.row_locks.lock().await.len()
    }

    fn take_commit_failure(&self) -> bool {
        self.inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn current_item(&self, tx: &InMemoryTx, key: ItemKey) -> Option<Item> {
        if let Some(item) = tx.items.get(&key) {
            return Some(item.clone());
        }
        self.inner.tables.lock().await.items.get(&key).cloned()
    }

    async fn current_document(&self, tx: &InMemoryTx, id: DocumentId) -> Option<Document> {
        if let Some(document) = tx.documents.get(&id) {
            return Some(document.clone());
        }
        self.inner.tables.lock().await.documents.get(&id).cloned()
    }
}

/// Transaction handle of [`InMemoryLedgerStore`].
///
/// Dropping a handle without committing discards its writes and releases
/// its locks.
pub struct InMemoryTx {
    status: TxStatus,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    counters: HashMap<CounterKey, Counter>,
    items: HashMap<ItemKey, Item>,
    documents: HashMap<DocumentId, Document>,
    movements: Vec<StockMovement>,
}

impl InMemoryTx {
    fn new() -> Self {
        Self {
            status: TxStatus::new(),
            guards: HashMap::new(),
            counters: HashMap::new(),
            items: HashMap::new(),
            documents: HashMap::new(),
            movements: Vec::new(),
        }
    }

    fn discard(&mut self) {
        self.counters.clear();
        self.items.clear();
        self.documents.clear();
        self.movements.clear();
    }
}

impl Transaction for InMemoryTx {
    fn id(&self) -> TxId {
        self.status.id()
    }

    fn state(&self) -> TxState {
        self.status.state()
    }
}

#[async_trait]
impl TransactionalStore for InMemoryLedgerStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = InMemoryTx::new();
        tx.status.activate()?;
        Ok(tx)
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<()> {
        tx.status.ensure_active()?;

        if self.take_commit_failure() {
            tx.status.mark_aborted()?;
            tx.discard();
            self.release_locks(&mut tx).await;
            return Err(StoreError::TransientConflict {
                reason: format!("{} aborted by injected commit failure", tx.status.id()),
            });
        }

        {
            let mut tables = self.inner.tables.lock().await;
            tables.counters.extend(tx.counters.drain());
            tables.items.extend(tx.items.drain());
            tables.documents.extend(tx.documents.drain());
            tables.movements.append(&mut tx.movements);
        }

        tx.status.mark_committed()?;
        // Locks are released only once the writes are visible.
        self.release_locks(&mut tx).await;
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Tx) -> Result<()> {
        tx.status.mark_aborted()?;
        tx.discard();
        self.release_locks(&mut tx).await;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for InMemoryLedgerStore {
    async fn increment_and_get(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
    ) -> Result<i64> {
        tx.status.ensure_active()?;
        self.lock_row(tx, RowKey::Counter(tenant_id, document_type))
            .await?;

        let key = (tenant_id, document_type);
        let current = match tx.counters.get(&key) {
            Some(counter) => counter.sequence,
            None => self
                .inner
                .tables
                .lock()
                .await
                .counters
                .get(&key)
                .map_or(0, |c| c.sequence),
        };

        let sequence = current + 1;
        tx.counters.insert(
            key,
            Counter {
                tenant_id,
                document_type,
                prefix: prefix.to_string(),
                sequence,
                last_generated_at: Utc::now(),
            },
        );
        Ok(sequence)
    }

    async fn peek(&self, tenant_id: TenantId, document_type: DocumentType) -> Result<i64> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .counters
            .get(&(tenant_id, document_type))
            .map_or(0, |c| c.sequence))
    }

    async fn reset(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
        sequence: i64,
    ) -> Result<()> {
        let mut tables = self.inner.tables.lock().await;
        tables.counters.insert(
            (tenant_id, document_type),
            Counter {
                tenant_id,
                document_type,
                prefix: prefix.to_string(),
                sequence,
                last_generated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_counters(&self, tenant_id: TenantId) -> Result<Vec<Counter>> {
        let tables = self.inner.tables.lock().await;
        let mut counters: Vec<_> = tables
            .counters
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        counters.sort_by_key(|c| c.document_type);
        Ok(counters)
    }
}

#[async_trait]
impl StockStore for InMemoryLedgerStore {
    async fn insert_item(&self, tx: &mut Self::Tx, item: &Item) -> Result<()> {
        tx.status.ensure_active()?;
        self.lock_row(tx, RowKey::Item(item.tenant_id, item.item_id))
            .await?;

        let key = (item.tenant_id, item.item_id);
        if self.current_item(tx, key).await.is_some() {
            return Err(StoreError::ItemAlreadyExists {
                tenant_id: item.tenant_id,
                item_id: item.item_id,
            });
        }

        tx.items.insert(key, item.clone());
        Ok(())
    }

    async fn adjust(&self, tx: &mut Self::Tx, adjustment: StockAdjustment) -> Result<i64> {
        tx.status.ensure_active()?;
        let StockAdjustment {
            tenant_id,
            item_id,
            delta,
            floor,
            reason,
            document_id,
        } = adjustment;

        self.lock_row(tx, RowKey::Item(tenant_id, item_id)).await?;

        let key = (tenant_id, item_id);
        let mut item = self
            .current_item(tx, key)
            .await
            .ok_or(StoreError::ItemNotFound { tenant_id, item_id })?;

        let balance = item.available_stock + delta;
        if floor == StockFloor::Enforced && balance < 0 {
            return Err(StoreError::InsufficientStock {
                item_id,
                available: item.available_stock,
                required: -delta,
                shortfall: -balance,
            });
        }

        item.available_stock = balance;
        tx.items.insert(key, item);
        tx.movements.push(StockMovement {
            tenant_id,
            item_id,
            delta,
            balance_after: balance,
            reason,
            document_id,
            recorded_at: Utc::now(),
        });
        Ok(balance)
    }

    async fn get_item(&self, tenant_id: TenantId, item_id: ItemId) -> Result<Option<Item>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables.items.get(&(tenant_id, item_id)).cloned())
    }

    async fn available_stock(&self, tenant_id: TenantId, item_id: ItemId) -> Result<i64> {
        self.get_item(tenant_id, item_id)
            .await?
            .map(|item| item.available_stock)
            .ok_or(StoreError::ItemNotFound { tenant_id, item_id })
    }

    async fn list_low_stock(&self, tenant_id: TenantId) -> Result<Vec<Item>> {
        let tables = self.inner.tables.lock().await;
        let mut items: Vec<_> = tables
            .items
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.is_active && i.is_low_stock())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn stock_summary(&self, tenant_id: TenantId) -> Result<StockSummary> {
        let tables = self.inner.tables.lock().await;
        Ok(StockSummary::from_items(
            tables.items.values().filter(|i| i.tenant_id == tenant_id),
        ))
    }

    async fn list_movements(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> Result<Vec<StockMovement>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.item_id == item_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentStore for InMemoryLedgerStore {
    async fn insert_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()> {
        tx.status.ensure_active()?;
        let document_type = document.document_type();

        self.lock_row(
            tx,
            RowKey::DocumentCode(document.tenant_id, document_type, document.code.clone()),
        )
        .await?;
        self.lock_row(tx, RowKey::Document(document.id)).await?;

        if self
            .code_exists(tx, document.tenant_id, document_type, &document.code)
            .await?
        {
            return Err(StoreError::DuplicateDocumentCode {
                tenant_id: document.tenant_id,
                document_type,
                code: document.code.clone(),
            });
        }

        tx.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn load_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Document> {
        tx.status.ensure_active()?;
        self.lock_row(tx, RowKey::Document(document_id)).await?;

        self.current_document(tx, document_id)
            .await
            .filter(|d| d.tenant_id == tenant_id && !d.is_deleted())
            .ok_or(StoreError::DocumentNotFound(document_id))
    }

    async fn update_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()> {
        let mut current = self
            .load_document(tx, document.tenant_id, document.id)
            .await?;
        current.body = document.body.clone();
        current.updated_at = Utc::now();
        tx.documents.insert(current.id, current);
        Ok(())
    }

    async fn delete_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        let mut current = self.load_document(tx, tenant_id, document_id).await?;
        let now = Utc::now();
        current.deleted_at = Some(now);
        current.updated_at = now;
        tx.documents.insert(current.id, current);
        Ok(())
    }

    async fn code_exists(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        code: &str,
    ) -> Result<bool> {
        tx.status.ensure_active()?;
        let matches = |d: &Document| {
            d.tenant_id == tenant_id && d.document_type() == document_type && d.code == code
        };

        if tx.documents.values().any(matches) {
            return Ok(true);
        }
        let tables = self.inner.tables.lock().await;
        Ok(tables.documents.values().any(matches))
    }

    async fn find_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .documents
            .get(&document_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }
}
