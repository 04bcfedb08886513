use std::time::Duration;

use async_trait::async_trait;
use common::{DocumentId, DocumentType, ItemId, Money, TenantId};
use sqlx::{PgPool, Postgres, Row, postgres::PgPoolOptions, postgres::PgRow};

use crate::{
    Counter, Document, DocumentBody, Item, Result, StockAdjustment, StockFloor, StockMovement,
    StockStore, StockSummary, StoreError,
    memory::DEFAULT_LOCK_TIMEOUT,
    store::{DocumentStore, SequenceStore, Transaction, TransactionalStore},
    tx::{TxId, TxState, TxStatus},
};

const DOCUMENT_CODE_CONSTRAINT: &str = "documents_tenant_type_code_key";
const ITEM_PRIMARY_KEY: &str = "items_pkey";

/// PostgreSQL-backed ledger store.
///
/// Counter increments are a single `INSERT … ON CONFLICT DO UPDATE …
/// RETURNING`, stock adjustments lock the item row with `SELECT … FOR
/// UPDATE`. Lock waits are bounded by `lock_timeout`, so a blocked
/// transaction surfaces as `TransientConflict` rather than hanging.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    /// Creates a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_counter(row: PgRow) -> Result<Counter> {
        let document_type: String = row.try_get("document_type")?;
        Ok(Counter {
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            document_type: parse_document_type(&document_type)?,
            prefix: row.try_get("prefix")?,
            sequence: row.try_get("sequence")?,
            last_generated_at: row.try_get("last_generated_at")?,
        })
    }

    fn row_to_item(row: PgRow) -> Result<Item> {
        Ok(Item {
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            item_id: ItemId::from_uuid(row.try_get("id")?),
            sku: row.try_get("sku")?,
            name: row.try_get("name")?,
            purchase_price: Money::from_cents(row.try_get("purchase_price_cents")?),
            available_stock: row.try_get("available_stock")?,
            reorder_level: row.try_get("reorder_level")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn row_to_document(row: PgRow) -> Result<Document> {
        let body: serde_json::Value = row.try_get("body")?;
        Ok(Document {
            id: DocumentId::from_uuid(row.try_get("id")?),
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            code: row.try_get("code")?,
            body: serde_json::from_value::<DocumentBody>(body)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_movement(row: PgRow) -> Result<StockMovement> {
        let reason: String = row.try_get("reason")?;
        let document_id: Option<uuid::Uuid> = row.try_get("document_id")?;
        Ok(StockMovement {
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            item_id: ItemId::from_uuid(row.try_get("item_id")?),
            delta: row.try_get("delta")?,
            balance_after: row.try_get("balance_after")?,
            reason: reason.parse()?,
            document_id: document_id.map(DocumentId::from_uuid),
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

fn parse_document_type(value: &str) -> Result<DocumentType> {
    value
        .parse()
        .map_err(|e: common::UnknownDocumentType| StoreError::InvalidRow(e.to_string()))
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

/// Transaction handle of [`PostgresLedgerStore`], wrapping one pooled
/// connection with an open `BEGIN`.
pub struct PostgresTx {
    status: TxStatus,
    inner: sqlx::Transaction<'static, Postgres>,
}

impl Transaction for PostgresTx {
    fn id(&self) -> TxId {
        self.status.id()
    }

    fn state(&self) -> TxState {
        self.status.state()
    }
}

#[async_trait]
impl TransactionalStore for PostgresLedgerStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = PostgresTx {
            status: TxStatus::new(),
            inner: self.pool.begin().await?,
        };

        // SET does not take bind parameters.
        let set_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_timeout).execute(&mut *tx.inner).await?;

        tx.status.activate()?;
        tracing::trace!(tx = %tx.status.id(), "transaction started");
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        let PostgresTx { mut status, inner } = tx;
        status.ensure_active()?;

        match inner.commit().await {
            Ok(()) => status.mark_committed(),
            Err(e) => {
                status.mark_aborted()?;
                Err(e.into())
            }
        }
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        let PostgresTx { mut status, inner } = tx;
        status.mark_aborted()?;
        inner.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for PostgresLedgerStore {
    async fn increment_and_get(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
    ) -> Result<i64> {
        tx.status.ensure_active()?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (tenant_id, document_type, prefix, sequence, last_generated_at)
            VALUES ($1, $2, $3, 1, now())
            ON CONFLICT (tenant_id, document_type) DO UPDATE SET
                sequence = counters.sequence + 1,
                prefix = EXCLUDED.prefix,
                last_generated_at = now(),
                updated_at = now()
            RETURNING sequence
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_type.as_str())
        .bind(prefix)
        .fetch_one(&mut *tx.inner)
        .await?;

        Ok(sequence)
    }

    async fn peek(&self, tenant_id: TenantId, document_type: DocumentType) -> Result<i64> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT sequence FROM counters WHERE tenant_id = $1 AND document_type = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(document_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(sequence.unwrap_or(0))
    }

    async fn reset(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: &str,
        sequence: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO counters (tenant_id, document_type, prefix, sequence, last_generated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (tenant_id, document_type) DO UPDATE SET
                sequence = EXCLUDED.sequence,
                prefix = EXCLUDED.prefix,
                last_generated_at = now(),
                updated_at = now()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_type.as_str())
        .bind(prefix)
        .bind(sequence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_counters(&self, tenant_id: TenantId) -> Result<Vec<Counter>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, document_type, prefix, sequence, last_generated_at
            FROM counters
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut counters = rows
            .into_iter()
            .map(Self::row_to_counter)
            .collect::<Result<Vec<_>>>()?;
        counters.sort_by_key(|c| c.document_type);
        Ok(counters)
    }
}

#[async_trait]
impl StockStore for PostgresLedgerStore {
    async fn insert_item(&self, tx: &mut Self::Tx, item: &Item) -> Result<()> {
        tx.status.ensure_active()?;

        sqlx::query(
            r#"
            INSERT INTO items (tenant_id, id, sku, name, purchase_price_cents, available_stock, reorder_level, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(item.tenant_id.as_uuid())
        .bind(item.item_id.as_uuid())
        .bind(&item.sku)
        .bind(&item.name)
        .bind(item.purchase_price.cents())
        .bind(item.available_stock)
        .bind(item.reorder_level)
        .bind(item.is_active)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| {
            if violates(&e, ITEM_PRIMARY_KEY) {
                return StoreError::ItemAlreadyExists {
                    tenant_id: item.tenant_id,
                    item_id: item.item_id,
                };
            }
            StoreError::from(e)
        })?;

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

        let available: i64 = sqlx::query_scalar(
            "SELECT available_stock FROM items WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&mut *tx.inner)
        .await?
        .ok_or(StoreError::ItemNotFound { tenant_id, item_id })?;

        let balance = available + delta;
        if floor == StockFloor::Enforced && balance < 0 {
            return Err(StoreError::InsufficientStock {
                item_id,
                available,
                required: -delta,
                shortfall: -balance,
            });
        }

        sqlx::query(
            "UPDATE items SET available_stock = $3, updated_at = now() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .bind(balance)
        .execute(&mut *tx.inner)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO stock_movements (tenant_id, item_id, delta, balance_after, reason, document_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .bind(delta)
        .bind(balance)
        .bind(reason.as_str())
        .bind(document_id.map(|id| id.as_uuid()))
        .execute(&mut *tx.inner)
        .await?;

        Ok(balance)
    }

    async fn get_item(&self, tenant_id: TenantId, item_id: ItemId) -> Result<Option<Item>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, id, sku, name, purchase_price_cents, available_stock, reorder_level, is_active
            FROM items
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_item).transpose()
    }

    async fn available_stock(&self, tenant_id: TenantId, item_id: ItemId) -> Result<i64> {
        let stock: Option<i64> = sqlx::query_scalar(
            "SELECT available_stock FROM items WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        stock.ok_or(StoreError::ItemNotFound { tenant_id, item_id })
    }

    async fn list_low_stock(&self, tenant_id: TenantId) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, id, sku, name, purchase_price_cents, available_stock, reorder_level, is_active
            FROM items
            WHERE tenant_id = $1 AND is_active AND available_stock <= reorder_level
            ORDER BY name ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_item).collect()
    }

    async fn stock_summary(&self, tenant_id: TenantId) -> Result<StockSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_items,
                COALESCE(SUM(available_stock * purchase_price_cents), 0)::BIGINT AS total_stock_value,
                COUNT(*) FILTER (WHERE available_stock <= reorder_level) AS low_stock_items
            FROM items
            WHERE tenant_id = $1 AND is_active
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        let total_items: i64 = row.try_get("total_items")?;
        let low_stock_items: i64 = row.try_get("low_stock_items")?;
        Ok(StockSummary {
            total_items: u64::try_from(total_items).unwrap_or_default(),
            total_stock_value: Money::from_cents(row.try_get("total_stock_value")?),
            low_stock_items: u64::try_from(low_stock_items).unwrap_or_default(),
        })
    }

    async fn list_movements(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> Result<Vec<StockMovement>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, item_id, delta, balance_after, reason, document_id, recorded_at
            FROM stock_movements
            WHERE tenant_id = $1 AND item_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_movement).collect()
    }
}

#[async_trait]
impl DocumentStore for PostgresLedgerStore {
    async fn insert_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()> {
        tx.status.ensure_active()?;
        let document_type = document.document_type();
        let body = serde_json::to_value(&document.body)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, tenant_id, document_type, code, body, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(document.tenant_id.as_uuid())
        .bind(document_type.as_str())
        .bind(&document.code)
        .bind(body)
        .bind(document.created_at)
        .bind(document.updated_at)
        .bind(document.deleted_at)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| {
            if violates(&e, DOCUMENT_CODE_CONSTRAINT) {
                return StoreError::DuplicateDocumentCode {
                    tenant_id: document.tenant_id,
                    document_type,
                    code: document.code.clone(),
                };
            }
            StoreError::from(e)
        })?;

        Ok(())
    }

    async fn load_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Document> {
        tx.status.ensure_active()?;

        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, code, body, created_at, updated_at, deleted_at
            FROM documents
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(document_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *tx.inner)
        .await?
        .ok_or(StoreError::DocumentNotFound(document_id))?;

        Self::row_to_document(row)
    }

    async fn update_document(&self, tx: &mut Self::Tx, document: &Document) -> Result<()> {
        tx.status.ensure_active()?;
        let body = serde_json::to_value(&document.body)?;

        let result = sqlx::query(
            r#"
            UPDATE documents SET body = $3, updated_at = now()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(document.tenant_id.as_uuid())
        .bind(body)
        .execute(&mut *tx.inner)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(document.id));
        }
        Ok(())
    }

    async fn delete_document(
        &self,
        tx: &mut Self::Tx,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        tx.status.ensure_active()?;

        let result = sqlx::query(
            r#"
            UPDATE documents SET deleted_at = now(), updated_at = now()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(document_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .execute(&mut *tx.inner)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(document_id));
        }
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

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM documents
                WHERE tenant_id = $1 AND document_type = $2 AND code = $3
            )
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_type.as_str())
        .bind(code)
        .fetch_one(&mut *tx.inner)
        .await?;

        Ok(exists)
    }

    async fn find_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, code, body, created_at, updated_at, deleted_at
            FROM documents
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(document_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_document).transpose()
    }
}
