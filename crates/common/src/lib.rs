//! Shared identifiers and value objects for the ledger engine.
//!
//! Every row the engine touches is partitioned by a [`TenantId`]; items and
//! documents carry their own typed identifiers so they cannot be mixed up.

pub mod document_type;
pub mod line_item;
pub mod money;
pub mod types;

pub use document_type::{DocumentType, UnknownDocumentType};
pub use line_item::LineItem;
pub use money::Money;
pub use types::{DocumentId, ItemId, TenantId};
