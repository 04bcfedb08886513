//! Document use cases built on the ledger core.
//!
//! Each public method is one unit of work run through
//! [`TransactionCoordinator::run_with_retry`]: the document row, its code
//! and its stock effect are written in the same transaction.

use async_trait::async_trait;
use chrono::Utc;
use common::{DocumentId, DocumentType, ItemId, LineItem, TenantId};
use ledger_store::{
    Document, DocumentBody, InMemoryLedgerStore, Item, LedgerStore, PostgresLedgerStore,
    StockMovement, StockSummary,
};

use crate::config::LedgerConfig;
use crate::coordinator::{TransactionCoordinator, UnitOfWork};
use crate::error::{LedgerError, Result};
use crate::sequence::SequenceGenerator;
use crate::stock::{Direction, StockLedger};

/// Service for bills, invoices, production orders and manual stock moves.
pub struct LedgerService<S> {
    coordinator: TransactionCoordinator<S>,
    sequences: SequenceGenerator<S>,
    stock: StockLedger<S>,
}

impl<S: LedgerStore + Clone> LedgerService<S> {
    /// Creates a service with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, &LedgerConfig::default())
    }

    pub fn with_config(store: S, config: &LedgerConfig) -> Self {
        Self {
            coordinator: TransactionCoordinator::with_retry_policy(store.clone(), config.retry),
            sequences: SequenceGenerator::with_padding(store.clone(), config.sequence_padding),
            stock: StockLedger::with_floor_policy(store, config.stock_floor),
        }
    }

    pub fn store(&self) -> &S {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<S> {
        &self.coordinator
    }

    pub fn sequences(&self) -> &SequenceGenerator<S> {
        &self.sequences
    }

    pub fn stock_ledger(&self) -> &StockLedger<S> {
        &self.stock
    }

    /// Seeds an item row; its opening stock becomes the available stock.
    #[tracing::instrument(skip(self, item), fields(item_id = %item.item_id))]
    pub async fn register_item(&self, item: Item) -> Result<Item> {
        self.coordinator
            .run_with_retry(&RegisterItem { item: &item })
            .await?;
        Ok(item)
    }

    /// Creates a bill (`BILL-nnnnn`) and books its items into stock.
    #[tracing::instrument(skip(self, items))]
    pub async fn create_bill(
        &self,
        tenant_id: TenantId,
        items: Vec<LineItem>,
    ) -> Result<Document> {
        validate_lines(&items)?;
        self.create_document(tenant_id, DocumentBody::Bill { items })
            .await
    }

    /// Replaces the items of a bill, moving stock by the net difference.
    #[tracing::instrument(skip(self, items))]
    pub async fn update_bill(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        items: Vec<LineItem>,
    ) -> Result<Document> {
        validate_lines(&items)?;
        self.update_document(tenant_id, document_id, Direction::Purchase, items)
            .await
    }

    /// Soft-deletes a bill and takes its items back out of stock.
    #[tracing::instrument(skip(self))]
    pub async fn delete_bill(&self, tenant_id: TenantId, document_id: DocumentId) -> Result<()> {
        self.delete_document(tenant_id, document_id, DocumentType::Bill)
            .await
    }

    /// Creates an invoice (`INV-nnnnn`). Fails with `InsufficientStock`
    /// if any item lacks the quantity sold.
    #[tracing::instrument(skip(self, items))]
    pub async fn create_invoice(
        &self,
        tenant_id: TenantId,
        items: Vec<LineItem>,
    ) -> Result<Document> {
        validate_lines(&items)?;
        self.create_document(tenant_id, DocumentBody::Invoice { items })
            .await
    }

    #[tracing::instrument(skip(self, items))]
    pub async fn update_invoice(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        items: Vec<LineItem>,
    ) -> Result<Document> {
        validate_lines(&items)?;
        self.update_document(tenant_id, document_id, Direction::Sale, items)
            .await
    }

    /// Soft-deletes an invoice and returns its items to stock.
    #[tracing::instrument(skip(self))]
    pub async fn delete_invoice(&self, tenant_id: TenantId, document_id: DocumentId) -> Result<()> {
        self.delete_document(tenant_id, document_id, DocumentType::Invoice)
            .await
    }

    /// Creates a production order: raw materials leave stock, finished
    /// goods enter it.
    #[tracing::instrument(skip(self, raw_materials, finished_goods))]
    pub async fn create_production_order(
        &self,
        tenant_id: TenantId,
        raw_materials: Vec<LineItem>,
        finished_goods: Vec<LineItem>,
    ) -> Result<Document> {
        if raw_materials.is_empty() && finished_goods.is_empty() {
            return Err(LedgerError::InvalidLineItem(
                "production order needs at least one raw material or finished good".to_string(),
            ));
        }
        raw_materials
            .iter()
            .chain(&finished_goods)
            .try_for_each(validate_quantity)?;

        self.create_document(
            tenant_id,
            DocumentBody::ProductionOrder {
                raw_materials,
                finished_goods,
            },
        )
        .await
    }

    /// Soft-deletes a production order and restores pre-order stock.
    #[tracing::instrument(skip(self))]
    pub async fn delete_production_order(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        self.delete_document(tenant_id, document_id, DocumentType::ProductionOrder)
            .await
    }

    /// Manual stock increase; returns the new balance.
    #[tracing::instrument(skip(self))]
    pub async fn add_stock(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        quantity: u32,
    ) -> Result<i64> {
        self.coordinator
            .run_with_retry(&ManualAdjustment {
                stock: &self.stock,
                tenant_id,
                item_id,
                quantity,
                increase: true,
            })
            .await
    }

    /// Manual stock decrease; returns the new balance.
    #[tracing::instrument(skip(self))]
    pub async fn remove_stock(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        quantity: u32,
    ) -> Result<i64> {
        self.coordinator
            .run_with_retry(&ManualAdjustment {
                stock: &self.stock,
                tenant_id,
                item_id,
                quantity,
                increase: false,
            })
            .await
    }

    pub async fn available_stock(&self, tenant_id: TenantId, item_id: ItemId) -> Result<i64> {
        self.stock.available_stock(tenant_id, item_id).await
    }

    pub async fn low_stock_items(&self, tenant_id: TenantId) -> Result<Vec<Item>> {
        self.stock.low_stock_items(tenant_id).await
    }

    pub async fn stock_summary(&self, tenant_id: TenantId) -> Result<StockSummary> {
        self.stock.stock_summary(tenant_id).await
    }

    pub async fn stock_movements(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> Result<Vec<StockMovement>> {
        self.stock.stock_movements(tenant_id, item_id).await
    }

    /// Looks up a document, soft-deleted ones included.
    pub async fn find_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>> {
        Ok(self.store().find_document(tenant_id, document_id).await?)
    }

    async fn create_document(&self, tenant_id: TenantId, body: DocumentBody) -> Result<Document> {
        let document = self
            .coordinator
            .run_with_retry(&CreateDocument {
                service: self,
                tenant_id,
                body: &body,
            })
            .await?;

        tracing::info!(document_id = %document.id, code = %document.code, "document created");
        Ok(document)
    }

    async fn update_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        direction: Direction,
        items: Vec<LineItem>,
    ) -> Result<Document> {
        self.coordinator
            .run_with_retry(&UpdateDocument {
                service: self,
                tenant_id,
                document_id,
                direction,
                items: &items,
            })
            .await
    }

    async fn delete_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        expected: DocumentType,
    ) -> Result<()> {
        self.coordinator
            .run_with_retry(&DeleteDocument {
                service: self,
                tenant_id,
                document_id,
                expected,
            })
            .await?;

        tracing::info!(%document_id, "document deleted");
        Ok(())
    }
}

impl LedgerService<InMemoryLedgerStore> {
    /// Creates a service over a fresh in-memory store whose row locks wait
    /// at most `config.lock_timeout`.
    pub fn in_memory(config: &LedgerConfig) -> Self {
        Self::with_config(
            InMemoryLedgerStore::with_lock_timeout(config.lock_timeout),
            config,
        )
    }
}

impl LedgerService<PostgresLedgerStore> {
    /// Connects to `config.database_url` with a pool of
    /// `config.max_connections`. Migrations are not run.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let database_url = config
            .database_url
            .as_deref()
            .ok_or(LedgerError::MissingDatabaseUrl)?;
        let store = PostgresLedgerStore::connect(database_url, config.max_connections)
            .await?
            .with_lock_timeout(config.lock_timeout);

        tracing::info!(max_connections = config.max_connections, "connected to PostgreSQL");
        Ok(Self::with_config(store, config))
    }
}

fn validate_quantity(line: &LineItem) -> Result<()> {
    if line.quantity == 0 {
        return Err(LedgerError::InvalidLineItem(format!(
            "quantity for item {} must be positive",
            line.item_id
        )));
    }
    Ok(())
}

fn validate_lines(items: &[LineItem]) -> Result<()> {
    if items.is_empty() {
        return Err(LedgerError::InvalidLineItem(
            "document needs at least one line item".to_string(),
        ));
    }
    items.iter().try_for_each(validate_quantity)
}

async fn load_expected<S: LedgerStore>(
    store: &S,
    tx: &mut S::Tx,
    tenant_id: TenantId,
    document_id: DocumentId,
    expected: DocumentType,
) -> Result<Document> {
    let document = store.load_document(tx, tenant_id, document_id).await?;
    let actual = document.document_type();
    if actual != expected {
        return Err(LedgerError::DocumentKindMismatch {
            document_id,
            expected,
            actual,
        });
    }
    Ok(document)
}

struct RegisterItem<'a> {
    item: &'a Item,
}

#[async_trait]
impl<S: LedgerStore> UnitOfWork<S> for RegisterItem<'_> {
    type Output = ();

    async fn run(&self, store: &S, tx: &mut S::Tx) -> Result<()> {
        Ok(store.insert_item(tx, self.item).await?)
    }
}

struct CreateDocument<'a, S> {
    service: &'a LedgerService<S>,
    tenant_id: TenantId,
    body: &'a DocumentBody,
}

#[async_trait]
impl<S: LedgerStore + Clone> UnitOfWork<S> for CreateDocument<'_, S> {
    type Output = Document;

    async fn run(&self, store: &S, tx: &mut S::Tx) -> Result<Document> {
        let document_type = self.body.document_type();
        let code = self
            .service
            .sequences
            .generate_unique_id(tx, self.tenant_id, document_type)
            .await?;

        let document = Document::new(self.tenant_id, code, self.body.clone());
        store.insert_document(tx, &document).await?;

        let stock = &self.service.stock;
        let document_id = Some(document.id);
        match &document.body {
            DocumentBody::Bill { items } => {
                stock
                    .apply_for_purchase(tx, self.tenant_id, items, document_id)
                    .await?;
            }
            DocumentBody::Invoice { items } => {
                stock
                    .apply_for_sale(tx, self.tenant_id, items, document_id)
                    .await?;
            }
            DocumentBody::ProductionOrder {
                raw_materials,
                finished_goods,
            } => {
                stock
                    .apply_for_production(
                        tx,
                        self.tenant_id,
                        raw_materials,
                        finished_goods,
                        document_id,
                    )
                    .await?;
            }
        }

        Ok(document)
    }
}

struct UpdateDocument<'a, S> {
    service: &'a LedgerService<S>,
    tenant_id: TenantId,
    document_id: DocumentId,
    direction: Direction,
    items: &'a [LineItem],
}

#[async_trait]
impl<S: LedgerStore + Clone> UnitOfWork<S> for UpdateDocument<'_, S> {
    type Output = Document;

    async fn run(&self, store: &S, tx: &mut S::Tx) -> Result<Document> {
        let expected = match self.direction {
            Direction::Purchase => DocumentType::Bill,
            Direction::Sale => DocumentType::Invoice,
        };
        let mut document =
            load_expected(store, tx, self.tenant_id, self.document_id, expected).await?;

        let old_items = match &document.body {
            DocumentBody::Bill { items } | DocumentBody::Invoice { items } => items.clone(),
            DocumentBody::ProductionOrder { .. } => {
                return Err(LedgerError::DocumentKindMismatch {
                    document_id: self.document_id,
                    expected,
                    actual: DocumentType::ProductionOrder,
                });
            }
        };

        if old_items.as_slice() != self.items {
            self.service
                .stock
                .reverse_and_reapply(
                    tx,
                    self.tenant_id,
                    &old_items,
                    self.items,
                    self.direction,
                    Some(document.id),
                )
                .await?;
        }

        document.body = match self.direction {
            Direction::Purchase => DocumentBody::Bill {
                items: self.items.to_vec(),
            },
            Direction::Sale => DocumentBody::Invoice {
                items: self.items.to_vec(),
            },
        };
        document.updated_at = Utc::now();
        store.update_document(tx, &document).await?;

        Ok(document)
    }
}

struct DeleteDocument<'a, S> {
    service: &'a LedgerService<S>,
    tenant_id: TenantId,
    document_id: DocumentId,
    expected: DocumentType,
}

#[async_trait]
impl<S: LedgerStore + Clone> UnitOfWork<S> for DeleteDocument<'_, S> {
    type Output = ();

    async fn run(&self, store: &S, tx: &mut S::Tx) -> Result<()> {
        let document =
            load_expected(store, tx, self.tenant_id, self.document_id, self.expected).await?;
        store
            .delete_document(tx, self.tenant_id, self.document_id)
            .await?;

        let stock = &self.service.stock;
        let document_id = Some(document.id);
        match &document.body {
            DocumentBody::Bill { items } => {
                stock
                    .reverse_document(tx, self.tenant_id, items, Direction::Purchase, document_id)
                    .await?;
            }
            DocumentBody::Invoice { items } => {
                stock
                    .reverse_document(tx, self.tenant_id, items, Direction::Sale, document_id)
                    .await?;
            }
            DocumentBody::ProductionOrder {
                raw_materials,
                finished_goods,
            } => {
                stock
                    .reverse_production(
                        tx,
                        self.tenant_id,
                        raw_materials,
                        finished_goods,
                        document_id,
                    )
                    .await?;
            }
        }

        Ok(())
    }
}

struct ManualAdjustment<'a, S> {
    stock: &'a StockLedger<S>,
    tenant_id: TenantId,
    item_id: ItemId,
    quantity: u32,
    increase: bool,
}

#[async_trait]
impl<S: LedgerStore> UnitOfWork<S> for ManualAdjustment<'_, S> {
    type Output = i64;

    async fn run(&self, _store: &S, tx: &mut S::Tx) -> Result<i64> {
        if self.increase {
            self.stock
                .add_stock(tx, self.tenant_id, self.item_id, self.quantity)
                .await
        } else {
            self.stock
                .remove_stock(tx, self.tenant_id, self.item_id, self.quantity)
                .await
        }
    }
}
