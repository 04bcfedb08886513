//! Rows persisted by the ledger store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{DocumentId, DocumentType, ItemId, LineItem, Money, TenantId};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Per-(tenant, document type) sequence counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub prefix: String,
    pub sequence: i64,
    pub last_generated_at: DateTime<Utc>,
}

/// The stock-relevant projection of an item-master row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub sku: String,
    pub name: String,
    pub purchase_price: Money,
    pub available_stock: i64,
    pub reorder_level: i64,
    pub is_active: bool,
}

impl Item {
    /// Creates an active item with no stock, no reorder level and a zero
    /// purchase price.
    pub fn new(tenant_id: TenantId, sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            item_id: ItemId::new(),
            sku: sku.into(),
            name: name.into(),
            purchase_price: Money::zero(),
            available_stock: 0,
            reorder_level: 0,
            is_active: true,
        }
    }

    /// Opening stock becomes the initial available stock.
    pub fn with_opening_stock(mut self, quantity: i64) -> Self {
        self.available_stock = quantity;
        self
    }

    pub fn with_reorder_level(mut self, level: i64) -> Self {
        self.reorder_level = level;
        self
    }

    pub fn with_purchase_price(mut self, price: Money) -> Self {
        self.purchase_price = price;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn is_low_stock(&self) -> bool {
        self.available_stock <= self.reorder_level
    }

    pub fn stock_value(&self) -> Money {
        self.purchase_price.times(self.available_stock)
    }
}

/// The line items of a document, shaped by what kind of document it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentBody {
    /// Vendor purchase: stock goes up.
    Bill { items: Vec<LineItem> },
    /// Sale: stock goes down.
    Invoice { items: Vec<LineItem> },
    /// Raw materials are consumed, finished goods are produced.
    ProductionOrder {
        raw_materials: Vec<LineItem>,
        finished_goods: Vec<LineItem>,
    },
}

impl DocumentBody {
    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentBody::Bill { .. } => DocumentType::Bill,
            DocumentBody::Invoice { .. } => DocumentType::Invoice,
            DocumentBody::ProductionOrder { .. } => DocumentType::ProductionOrder,
        }
    }
}

/// A persisted bill, invoice or production order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub code: String,
    pub body: DocumentBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(tenant_id: TenantId, code: impl Into<String>, body: DocumentBody) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            tenant_id,
            code: code.into(),
            body,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn document_type(&self) -> DocumentType {
        self.body.document_type()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Whether an adjustment may drive available stock below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockFloor {
    /// Fail with `InsufficientStock` instead of going negative.
    Enforced,
    /// Apply the delta whatever the resulting balance.
    Unchecked,
}

/// Why a stock movement happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Purchase,
    Sale,
    PurchaseEdit,
    SaleEdit,
    PurchaseReversal,
    SaleReversal,
    ProductionConsumption,
    ProductionOutput,
    ProductionReversal,
    ManualAdd,
    ManualRemove,
}

impl MovementReason {
    const ALL: [MovementReason; 11] = [
        MovementReason::Purchase,
        MovementReason::Sale,
        MovementReason::PurchaseEdit,
        MovementReason::SaleEdit,
        MovementReason::PurchaseReversal,
        MovementReason::SaleReversal,
        MovementReason::ProductionConsumption,
        MovementReason::ProductionOutput,
        MovementReason::ProductionReversal,
        MovementReason::ManualAdd,
        MovementReason::ManualRemove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Purchase => "purchase",
            MovementReason::Sale => "sale",
            MovementReason::PurchaseEdit => "purchase_edit",
            MovementReason::SaleEdit => "sale_edit",
            MovementReason::PurchaseReversal => "purchase_reversal",
            MovementReason::SaleReversal => "sale_reversal",
            MovementReason::ProductionConsumption => "production_consumption",
            MovementReason::ProductionOutput => "production_output",
            MovementReason::ProductionReversal => "production_reversal",
            MovementReason::ManualAdd => "manual_add",
            MovementReason::ManualRemove => "manual_remove",
        }
    }
}

impl std::fmt::Display for MovementReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown movement reason: {s}")))
    }
}

/// One guarded add/subtract against an item's available stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAdjustment {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub delta: i64,
    pub floor: StockFloor,
    pub reason: MovementReason,
    pub document_id: Option<DocumentId>,
}

impl StockAdjustment {
    pub fn new(tenant_id: TenantId, item_id: ItemId, delta: i64, reason: MovementReason) -> Self {
        Self {
            tenant_id,
            item_id,
            delta,
            floor: StockFloor::Unchecked,
            reason,
            document_id: None,
        }
    }

    pub fn with_floor(mut self, floor: StockFloor) -> Self {
        self.floor = floor;
        self
    }

    pub fn for_document(mut self, document_id: Option<DocumentId>) -> Self {
        self.document_id = document_id;
        self
    }
}

/// Append-only record of one applied adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: MovementReason,
    pub document_id: Option<DocumentId>,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate stock figures over a tenant's active items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockSummary {
    pub total_items: u64,
    pub total_stock_value: Money,
    pub low_stock_items: u64,
}

impl StockSummary {
    /// Folds the summary from a set of item rows, ignoring inactive ones.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a Item>) -> Self {
        items
            .into_iter()
            .filter(|item| item.is_active)
            .fold(StockSummary::default(), |mut acc, item| {
                acc.total_items += 1;
                acc.total_stock_value += item.stock_value();
                if item.is_low_stock() {
                    acc.low_stock_items += 1;
                }
                acc
            })
    }
}
