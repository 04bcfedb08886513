//! Logical document types that own an independent code sequence.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A document type with its own per-tenant counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Customer,
    Item,
    Invoice,
    Quote,
    PurchaseOrder,
    SalesOrder,
    Payment,
    Receipt,
    Bill,
    ProductionOrder,
}

impl DocumentType {
    pub const ALL: [DocumentType; 10] = [
        DocumentType::Customer,
        DocumentType::Item,
        DocumentType::Invoice,
        DocumentType::Quote,
        DocumentType::PurchaseOrder,
        DocumentType::SalesOrder,
        DocumentType::Payment,
        DocumentType::Receipt,
        DocumentType::Bill,
        DocumentType::ProductionOrder,
    ];

    /// Returns the registry key, e.g. `"PRODUCTION_ORDER"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Customer => "CUSTOMER",
            DocumentType::Item => "ITEM",
            DocumentType::Invoice => "INVOICE",
            DocumentType::Quote => "QUOTE",
            DocumentType::PurchaseOrder => "PURCHASE_ORDER",
            DocumentType::SalesOrder => "SALES_ORDER",
            DocumentType::Payment => "PAYMENT",
            DocumentType::Receipt => "RECEIPT",
            DocumentType::Bill => "BILL",
            DocumentType::ProductionOrder => "PRODUCTION_ORDER",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The given name does not match any known document type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown document type: {0}")]
pub struct UnknownDocumentType(pub String);

impl FromStr for DocumentType {
    type Err = UnknownDocumentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownDocumentType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_keys() {
        for doc_type in DocumentType::ALL {
            assert_eq!(doc_type.as_str().parse::<DocumentType>(), Ok(doc_type));
        }
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = "SHIPMENT".parse::<DocumentType>().unwrap_err();
        assert_eq!(err, UnknownDocumentType("SHIPMENT".to_string()));
        assert!("invoice".parse::<DocumentType>().is_err());
    }

    #[test]
    fn serde_uses_registry_keys() {
        let json = serde_json::to_string(&DocumentType::ProductionOrder).unwrap();
        assert_eq!(json, "\"PRODUCTION_ORDER\"");
    }
}
