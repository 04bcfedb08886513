//! Ledger error types.

use common::{DocumentId, DocumentType, TenantId, UnknownDocumentType};
use ledger_store::StoreError;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The document type is not in the sequence registry.
    #[error("Unknown document type: {0}")]
    UnknownDocumentType(String),

    /// Every generated code within the attempt budget was already taken.
    #[error("Sequence exhausted for {document_type} (tenant {tenant_id}) after {attempts} attempts")]
    SequenceExhausted {
        tenant_id: TenantId,
        document_type: DocumentType,
        attempts: u32,
    },

    /// The coordinator gave up after repeated transient conflicts.
    #[error("Transaction failed after {attempts} attempts: {last_error}")]
    TransactionRetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<LedgerError>,
    },

    /// A document's line items were rejected before touching any store.
    #[error("Invalid line item: {0}")]
    InvalidLineItem(String),

    /// A counter cannot be reset to a negative value.
    #[error("Invalid sequence value: {0}")]
    InvalidSequence(i64),

    /// The document exists but belongs to a different use case.
    #[error("Document {document_id} is a {actual}, expected {expected}")]
    DocumentKindMismatch {
        document_id: DocumentId,
        expected: DocumentType,
        actual: DocumentType,
    },

    /// A PostgreSQL-backed service was requested without `DATABASE_URL`.
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    /// An error occurred in the ledger store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<UnknownDocumentType> for LedgerError {
    fn from(err: UnknownDocumentType) -> Self {
        LedgerError::UnknownDocumentType(err.0)
    }
}

impl LedgerError {
    /// True for store conflicts that the coordinator retries by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_transient())
    }

    /// True when the caller may submit the same request again later.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, LedgerError::TransactionRetriesExhausted { .. })
    }

    /// True when the request itself is at fault and retrying cannot help.
    pub fn is_client_error(&self) -> bool {
        match self {
            LedgerError::UnknownDocumentType(_)
            | LedgerError::InvalidLineItem(_)
            | LedgerError::InvalidSequence(_)
            | LedgerError::DocumentKindMismatch { .. } => true,
            LedgerError::Store(e) => matches!(
                e,
                StoreError::ItemNotFound { .. }
                    | StoreError::ItemAlreadyExists { .. }
                    | StoreError::InsufficientStock { .. }
                    | StoreError::DocumentNotFound(_)
            ),
            _ => false,
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::ItemId;

    #[test]
    fn insufficient_stock_is_a_client_error() {
        let err = LedgerError::from(StoreError::InsufficientStock {
            item_id: ItemId::new(),
            available: 3,
            required: 5,
            shortfall: 2,
        });
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflicts_are_retryable_not_client_errors() {
        let err = LedgerError::from(StoreError::TransientConflict {
            reason: "lock timeout".to_string(),
        });
        assert!(err.is_transient());
        assert!(err.is_retryable());
        assert!(!err.is_client_error());

        let exhausted = LedgerError::TransactionRetriesExhausted {
            attempts: 5,
            last_error: Box::new(err),
        };
        assert!(!exhausted.is_transient());
        assert!(exhausted.is_retryable());
        assert!(exhausted.to_string().contains("5 attempts"));
    }

    #[test]
    fn missing_database_url_is_neither_client_nor_transient() {
        let err = LedgerError::MissingDatabaseUrl;
        assert!(!err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn unknown_document_type_converts() {
        let err: LedgerError = "WIDGET".parse::<DocumentType>().unwrap_err().into();
        assert!(matches!(err, LedgerError::UnknownDocumentType(ref name) if name == "WIDGET"));
        assert!(err.is_client_error());
    }
}
