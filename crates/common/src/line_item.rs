use serde::{Deserialize, Serialize};

use crate::ItemId;

/// An `{itemId, quantity}` pair inside a bill, invoice or production order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: ItemId,
    pub quantity: u32,
}

impl LineItem {
    pub fn new(item_id: ItemId, quantity: u32) -> Self {
        Self { item_id, quantity }
    }

    /// The quantity as a signed value, ready to be turned into a stock delta.
    pub fn signed_quantity(&self) -> i64 {
        i64::from(self.quantity)
    }
}
