use common::{DocumentId, DocumentType, ItemId, TenantId};
use thiserror::Error;

use crate::tx::{TxId, TxState};

/// Errors that can occur when interacting with the ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The item does not resolve under the given tenant.
    #[error("Item not found: {item_id} (tenant {tenant_id})")]
    ItemNotFound { tenant_id: TenantId, item_id: ItemId },

    /// An item with this id is already registered for the tenant.
    #[error("Item already exists: {item_id} (tenant {tenant_id})")]
    ItemAlreadyExists { tenant_id: TenantId, item_id: ItemId },

    /// A guarded decrement would drive available stock below zero.
    #[error(
        "Insufficient stock for item {item_id}: available {available}, required {required} (short by {shortfall})"
    )]
    InsufficientStock {
        item_id: ItemId,
        available: i64,
        required: i64,
        shortfall: i64,
    },

    /// The document does not exist, belongs to another tenant, or was deleted.
    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// Another document of the same tenant and type already carries this code.
    #[error("Duplicate {document_type} code {code} for tenant {tenant_id}")]
    DuplicateDocumentCode {
        tenant_id: TenantId,
        document_type: DocumentType,
        code: String,
    },

    /// A write conflict, deadlock or lock/transaction timeout. Safe to retry.
    #[error("Transient conflict: {reason}")]
    TransientConflict { reason: String },

    /// A store call was made on a handle that is not in the `Active` state.
    #[error("Transaction {id} is not active (state: {state})")]
    TransactionNotActive { id: TxId, state: TxState },

    /// A persisted row could not be decoded.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for failures that a fresh attempt of the same
    /// transaction may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientConflict { .. })
    }
}

/// SQLSTATE codes reported by PostgreSQL for conflicts that abort a
/// transaction without saying anything about the request itself.
const TRANSIENT_SQLSTATES: [&str; 5] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement_timeout)
    "25P03", // idle_in_transaction_session_timeout
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)) =>
            {
                StoreError::TransientConflict {
                    reason: db_err.message().to_string(),
                }
            }
            sqlx::Error::PoolTimedOut => StoreError::TransientConflict {
                reason: "timed out waiting for a pooled connection".to_string(),
            },
            _ => StoreError::Database(err),
        }
    }
}

/// Result type for ledger store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_transient() {
        let conflict = StoreError::TransientConflict {
            reason: "deadlock".to_string(),
        };
        assert!(conflict.is_transient());

        let missing = StoreError::ItemNotFound {
            tenant_id: TenantId::new(),
            item_id: ItemId::new(),
        };
        assert!(!missing.is_transient());
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_is_a_database_error() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn insufficient_stock_message_names_shortfall() {
        let item_id = ItemId::new();
        let err = StoreError::InsufficientStock {
            item_id,
            available: 3,
            required: 5,
            shortfall: 2,
        };
        assert!(err.to_string().contains("short by 2"));
    }
}
