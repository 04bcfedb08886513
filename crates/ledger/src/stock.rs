//! Stock effects of documents.
//!
//! [`StockLedger`] turns line items into signed adjustments of item stock.
//! Nothing here commits: every mutation runs on the caller's transaction,
//! so a document and its stock effect land together or not at all.

use std::collections::BTreeMap;
use std::str::FromStr;

use common::{DocumentId, ItemId, LineItem, TenantId};
use ledger_store::{
    Item, MovementReason, StockAdjustment, StockFloor, StockMovement, StockStore, StockSummary,
};

use crate::error::{LedgerError, Result};

/// Which decrements must not drive stock below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StockFloorPolicy {
    /// Only invoice-driven decrements are checked; manual removals,
    /// production consumption and purchase reversals may go negative.
    #[default]
    SalesOnly,
    /// Every decrement is checked.
    AllDecrements,
}

impl FromStr for StockFloorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sales" | "sales_only" => Ok(StockFloorPolicy::SalesOnly),
            "all" | "all_decrements" => Ok(StockFloorPolicy::AllDecrements),
            other => Err(format!("unknown stock floor policy: {other}")),
        }
    }
}

/// The semantic direction of a bill or invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bills add stock.
    Purchase,
    /// Invoices remove stock.
    Sale,
}

impl Direction {
    pub fn sign(&self) -> i64 {
        match self {
            Direction::Purchase => 1,
            Direction::Sale => -1,
        }
    }

    fn edit_reason(&self) -> MovementReason {
        match self {
            Direction::Purchase => MovementReason::PurchaseEdit,
            Direction::Sale => MovementReason::SaleEdit,
        }
    }

    fn reversal_reason(&self) -> MovementReason {
        match self {
            Direction::Purchase => MovementReason::PurchaseReversal,
            Direction::Sale => MovementReason::SaleReversal,
        }
    }
}

/// Signed per-item quantity deltas a document imposes on stock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StockEffect {
    deltas: Vec<(ItemId, i64)>,
}

impl StockEffect {
    /// One delta per item, `sign * quantity` summed over its lines.
    /// Deltas are ordered by item.
    pub fn from_lines(lines: &[LineItem], sign: i64) -> Self {
        let mut quantities: BTreeMap<ItemId, i64> = BTreeMap::new();
        for line in lines {
            *quantities.entry(line.item_id).or_default() += line.signed_quantity();
        }

        Self {
            deltas: quantities
                .into_iter()
                .map(|(item_id, quantity)| (item_id, sign * quantity))
                .filter(|(_, delta)| *delta != 0)
                .collect(),
        }
    }

    /// The single net delta per item that turns the effect of `old` into
    /// the effect of `new`: `sign * (new_qty - old_qty)`. Items whose total
    /// quantity is unchanged are left out. Deltas are ordered by item.
    pub fn net_change(old: &[LineItem], new: &[LineItem], direction: Direction) -> Self {
        let mut quantities: BTreeMap<ItemId, (i64, i64)> = BTreeMap::new();
        for line in old {
            quantities.entry(line.item_id).or_default().0 += line.signed_quantity();
        }
        for line in new {
            quantities.entry(line.item_id).or_default().1 += line.signed_quantity();
        }

        Self {
            deltas: quantities
                .into_iter()
                .map(|(item_id, (old_qty, new_qty))| {
                    (item_id, direction.sign() * (new_qty - old_qty))
                })
                .filter(|(_, delta)| *delta != 0)
                .collect(),
        }
    }

    pub fn deltas(&self) -> &[(ItemId, i64)] {
        &self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Net delta for one item across all its entries.
    pub fn delta_for(&self, item_id: ItemId) -> i64 {
        self.deltas
            .iter()
            .filter(|(id, _)| *id == item_id)
            .map(|(_, delta)| delta)
            .sum()
    }
}

/// Applies and compensates document stock effects.
#[derive(Clone)]
pub struct StockLedger<S> {
    store: S,
    floor_policy: StockFloorPolicy,
}

impl<S: StockStore> StockLedger<S> {
    pub fn new(store: S) -> Self {
        Self::with_floor_policy(store, StockFloorPolicy::default())
    }

    pub fn with_floor_policy(store: S, floor_policy: StockFloorPolicy) -> Self {
        Self {
            store,
            floor_policy,
        }
    }

    pub fn floor_policy(&self) -> StockFloorPolicy {
        self.floor_policy
    }

    fn floor_for(&self, delta: i64, reason: MovementReason) -> StockFloor {
        let sales_path = matches!(reason, MovementReason::Sale | MovementReason::SaleEdit);
        if delta < 0 && (sales_path || self.floor_policy == StockFloorPolicy::AllDecrements) {
            StockFloor::Enforced
        } else {
            StockFloor::Unchecked
        }
    }

    async fn adjust(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        item_id: ItemId,
        delta: i64,
        reason: MovementReason,
        document_id: Option<DocumentId>,
    ) -> Result<i64> {
        let adjustment = StockAdjustment::new(tenant_id, item_id, delta, reason)
            .with_floor(self.floor_for(delta, reason))
            .for_document(document_id);

        let balance = self.store.adjust(tx, adjustment).await?;

        tracing::debug!(%item_id, delta, balance, %reason, "stock adjusted");
        metrics::counter!("ledger_stock_adjustments_total", "reason" => reason.as_str())
            .increment(1);
        Ok(balance)
    }

    async fn apply_effect(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        effect: &StockEffect,
        reason: MovementReason,
        document_id: Option<DocumentId>,
    ) -> Result<()> {
        self.apply_effects(tx, tenant_id, &[(effect, reason)], document_id).await
    }

    /// Applies several effects as one pass in ascending item order, so two
    /// transactions always lock shared items in the same order. For an item
    /// present in more than one effect, effects apply in the order given.
    async fn apply_effects(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        effects: &[(&StockEffect, MovementReason)],
        document_id: Option<DocumentId>,
    ) -> Result<()> {
        let mut adjustments: Vec<(ItemId, i64, MovementReason)> = effects
            .iter()
            .flat_map(|(effect, reason)| {
                effect
                    .deltas()
                    .iter()
                    .map(move |&(item_id, delta)| (item_id, delta, *reason))
            })
            .collect();
        adjustments.sort_by_key(|(item_id, _, _)| *item_id);

        for (item_id, delta, reason) in adjustments {
            self.adjust(tx, tenant_id, item_id, delta, reason, document_id)
                .await?;
        }
        Ok(())
    }

    /// Adds every line's quantity to stock (bill created).
    #[tracing::instrument(skip(self, tx, lines), fields(lines = lines.len()))]
    pub async fn apply_for_purchase(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        lines: &[LineItem],
        document_id: Option<DocumentId>,
    ) -> Result<StockEffect> {
        let effect = StockEffect::from_lines(lines, 1);
        self.apply_effect(tx, tenant_id, &effect, MovementReason::Purchase, document_id)
            .await?;
        Ok(effect)
    }

    /// Removes every line's quantity from stock (invoice created). Fails
    /// with `InsufficientStock` if any item would go negative.
    #[tracing::instrument(skip(self, tx, lines), fields(lines = lines.len()))]
    pub async fn apply_for_sale(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        lines: &[LineItem],
        document_id: Option<DocumentId>,
    ) -> Result<StockEffect> {
        let effect = StockEffect::from_lines(lines, -1);
        self.apply_effect(tx, tenant_id, &effect, MovementReason::Sale, document_id)
            .await?;
        Ok(effect)
    }

    /// Moves stock from the effect of `old` to the effect of `new` with one
    /// net adjustment per changed item.
    #[tracing::instrument(skip(self, tx, old, new))]
    pub async fn reverse_and_reapply(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        old: &[LineItem],
        new: &[LineItem],
        direction: Direction,
        document_id: Option<DocumentId>,
    ) -> Result<StockEffect> {
        let effect = StockEffect::net_change(old, new, direction);
        self.apply_effect(tx, tenant_id, &effect, direction.edit_reason(), document_id)
            .await?;
        Ok(effect)
    }

    /// Undoes the effect of a bill or invoice that is being deleted.
    #[tracing::instrument(skip(self, tx, lines), fields(lines = lines.len()))]
    pub async fn reverse_document(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        lines: &[LineItem],
        direction: Direction,
        document_id: Option<DocumentId>,
    ) -> Result<StockEffect> {
        let effect = StockEffect::from_lines(lines, -direction.sign());
        self.apply_effect(tx, tenant_id, &effect, direction.reversal_reason(), document_id)
            .await?;
        Ok(effect)
    }

    /// Consumes raw materials, then books finished goods.
    #[tracing::instrument(skip(self, tx, raw_materials, finished_goods))]
    pub async fn apply_for_production(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        raw_materials: &[LineItem],
        finished_goods: &[LineItem],
        document_id: Option<DocumentId>,
    ) -> Result<()> {
        let consumed = StockEffect::from_lines(raw_materials, -1);
        let produced = StockEffect::from_lines(finished_goods, 1);

        self.apply_effects(
            tx,
            tenant_id,
            &[
                (&consumed, MovementReason::ProductionConsumption),
                (&produced, MovementReason::ProductionOutput),
            ],
            document_id,
        )
        .await
    }

    /// Exact inverse of [`apply_for_production`](Self::apply_for_production).
    #[tracing::instrument(skip(self, tx, raw_materials, finished_goods))]
    pub async fn reverse_production(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        raw_materials: &[LineItem],
        finished_goods: &[LineItem],
        document_id: Option<DocumentId>,
    ) -> Result<()> {
        let restored = StockEffect::from_lines(raw_materials, 1);
        let withdrawn = StockEffect::from_lines(finished_goods, -1);

        self.apply_effects(
            tx,
            tenant_id,
            &[
                (&restored, MovementReason::ProductionReversal),
                (&withdrawn, MovementReason::ProductionReversal),
            ],
            document_id,
        )
        .await
    }

    /// Manual stock increase. Returns the new balance.
    #[tracing::instrument(skip(self, tx))]
    pub async fn add_stock(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        item_id: ItemId,
        quantity: u32,
    ) -> Result<i64> {
        ensure_positive(item_id, quantity)?;
        self.adjust(
            tx,
            tenant_id,
            item_id,
            i64::from(quantity),
            MovementReason::ManualAdd,
            None,
        )
        .await
    }

    /// Manual stock decrease. Returns the new balance.
    #[tracing::instrument(skip(self, tx))]
    pub async fn remove_stock(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        item_id: ItemId,
        quantity: u32,
    ) -> Result<i64> {
        ensure_positive(item_id, quantity)?;
        self.adjust(
            tx,
            tenant_id,
            item_id,
            -i64::from(quantity),
            MovementReason::ManualRemove,
            None,
        )
        .await
    }

    pub async fn available_stock(&self, tenant_id: TenantId, item_id: ItemId) -> Result<i64> {
        Ok(self.store.available_stock(tenant_id, item_id).await?)
    }

    /// Active items at or below their reorder level.
    pub async fn low_stock_items(&self, tenant_id: TenantId) -> Result<Vec<Item>> {
        Ok(self.store.list_low_stock(tenant_id).await?)
    }

    pub async fn stock_summary(&self, tenant_id: TenantId) -> Result<StockSummary> {
        Ok(self.store.stock_summary(tenant_id).await?)
    }

    pub async fn stock_movements(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> Result<Vec<StockMovement>> {
        Ok(self.store.list_movements(tenant_id, item_id).await?)
    }
}

fn ensure_positive(item_id: ItemId, quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(LedgerError::InvalidLineItem(format!(
            "quantity for item {item_id} must be positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ledger_store::{InMemoryLedgerStore, StoreError, TransactionalStore};

    use super::*;

    async fn seed(store: &InMemoryLedgerStore, tenant_id: TenantId, stock: i64) -> ItemId {
        let item = Item::new(tenant_id, "SKU", "Widget").with_opening_stock(stock);
        let mut tx = store.begin().await.unwrap();
        store.insert_item(&mut tx, &item).await.unwrap();
        store.commit(tx).await.unwrap();
        item.item_id
    }

    #[test]
    fn test_net_change_skips_unchanged_items() {
        let x = ItemId::new();
        let y = ItemId::new();
        let z = ItemId::new();
        let old = [LineItem::new(x, 5), LineItem::new(y, 2)];
        let new = [LineItem::new(x, 5), LineItem::new(y, 6), LineItem::new(z, 1)];

        let effect = StockEffect::net_change(&old, &new, Direction::Sale);

        assert_eq!(effect.deltas().len(), 2);
        assert_eq!(effect.delta_for(x), 0);
        assert_eq!(effect.delta_for(y), -4);
        assert_eq!(effect.delta_for(z), -1);
    }

    #[test]
    fn test_net_change_merges_duplicate_lines() {
        let x = ItemId::new();
        let old = [LineItem::new(x, 2), LineItem::new(x, 3)];
        let new = [LineItem::new(x, 5)];

        assert!(StockEffect::net_change(&old, &new, Direction::Purchase).is_empty());
    }

    #[test]
    fn test_from_lines_orders_items_ascending() {
        let mut ids = [ItemId::new(), ItemId::new(), ItemId::new()];
        ids.sort();
        let [low, mid, high] = ids;
        let lines = [
            LineItem::new(high, 1),
            LineItem::new(low, 2),
            LineItem::new(mid, 3),
            LineItem::new(high, 4),
        ];

        let effect = StockEffect::from_lines(&lines, -1);

        assert_eq!(effect.deltas(), &[(low, -2), (mid, -3), (high, -5)]);
    }

    #[tokio::test]
    async fn test_production_with_crossed_items() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::new(store.clone());
        let tenant_id = TenantId::new();
        let a = seed(&store, tenant_id, 10).await;
        let b = seed(&store, tenant_id, 10).await;
        let (low, high) = if a < b { (a, b) } else { (b, a) };

        let mut tx = store.begin().await.unwrap();
        ledger
            .apply_for_production(
                &mut tx,
                tenant_id,
                &[LineItem::new(high, 3)],
                &[LineItem::new(low, 1)],
                None,
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(ledger.available_stock(tenant_id, low).await.unwrap(), 11);
        assert_eq!(ledger.available_stock(tenant_id, high).await.unwrap(), 7);
    }

    #[test]
    fn test_floor_policy_parsing() {
        assert_eq!("sales".parse::<StockFloorPolicy>(), Ok(StockFloorPolicy::SalesOnly));
        assert_eq!("ALL".parse::<StockFloorPolicy>(), Ok(StockFloorPolicy::AllDecrements));
        assert!("never".parse::<StockFloorPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_manual_removal_is_unchecked_by_default() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::new(store.clone());
        let tenant_id = TenantId::new();
        let item_id = seed(&store, tenant_id, 2).await;

        let mut tx = store.begin().await.unwrap();
        let balance = ledger
            .remove_stock(&mut tx, tenant_id, item_id, 5)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(balance, -3);
    }

    #[tokio::test]
    async fn test_all_decrements_policy_checks_manual_removal() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::with_floor_policy(store.clone(), StockFloorPolicy::AllDecrements);
        let tenant_id = TenantId::new();
        let item_id = seed(&store, tenant_id, 2).await;

        let mut tx = store.begin().await.unwrap();
        let result = ledger.remove_stock(&mut tx, tenant_id, item_id, 5).await;

        assert!(matches!(
            result,
            Err(LedgerError::Store(StoreError::InsufficientStock {
                shortfall: 3,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_zero_quantity_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::new(store.clone());
        let tenant_id = TenantId::new();
        let item_id = seed(&store, tenant_id, 2).await;

        let mut tx = store.begin().await.unwrap();
        let result = ledger.add_stock(&mut tx, tenant_id, item_id, 0).await;

        assert!(matches!(result, Err(LedgerError::InvalidLineItem(_))));
    }

    #[tokio::test]
    async fn test_sale_edit_increase_is_floor_checked() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::new(store.clone());
        let tenant_id = TenantId::new();
        let item_id = seed(&store, tenant_id, 3).await;

        let mut tx = store.begin().await.unwrap();
        let result = ledger
            .reverse_and_reapply(
                &mut tx,
                tenant_id,
                &[LineItem::new(item_id, 1)],
                &[LineItem::new(item_id, 5)],
                Direction::Sale,
                None,
            )
            .await;

        assert!(matches!(
            result,
            Err(LedgerError::Store(StoreError::InsufficientStock {
                shortfall: 1,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_edit_records_one_movement_per_changed_item() {
        let store = InMemoryLedgerStore::new();
        let ledger = StockLedger::new(store.clone());
        let tenant_id = TenantId::new();
        let item_id = seed(&store, tenant_id, 10).await;

        let mut tx = store.begin().await.unwrap();
        ledger
            .reverse_and_reapply(
                &mut tx,
                tenant_id,
                &[LineItem::new(item_id, 4)],
                &[LineItem::new(item_id, 1)],
                Direction::Purchase,
                None,
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let movements = ledger.stock_movements(tenant_id, item_id).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].delta, -3);
        assert_eq!(movements[0].reason, MovementReason::PurchaseEdit);
        assert_eq!(ledger.available_stock(tenant_id, item_id).await.unwrap(), 7);
    }
}
