//! Human-readable document codes backed by per-tenant counters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{DocumentType, TenantId};
use ledger_store::{DocumentStore, SequenceStore};
use serde::Serialize;

use crate::error::{LedgerError, Result};

/// Codes re-generated before giving up when a freshly issued code is
/// already carried by a document.
pub const MAX_CODE_ATTEMPTS: u32 = 3;

pub const DEFAULT_PADDING: usize = 5;

/// Registry entry of a document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceConfig {
    pub document_type: DocumentType,
    pub short_name: &'static str,
    pub prefix: &'static str,
}

/// Looks up the registry entry of a document type.
pub fn sequence_config(document_type: DocumentType) -> SequenceConfig {
    let (short_name, prefix) = match document_type {
        DocumentType::Customer => ("customer", "CUS"),
        DocumentType::Item => ("item", "ITM"),
        DocumentType::Invoice => ("invoice", "INV"),
        DocumentType::Quote => ("quote", "QUO"),
        DocumentType::PurchaseOrder => ("purchase_order", "PO"),
        DocumentType::SalesOrder => ("sales_order", "SO"),
        DocumentType::Payment => ("payment", "PAY"),
        DocumentType::Receipt => ("receipt", "REC"),
        DocumentType::Bill => ("bill", "BILL"),
        DocumentType::ProductionOrder => ("production_order", "Production_Order"),
    };

    SequenceConfig {
        document_type,
        short_name,
        prefix,
    }
}

/// Resolves a registry key such as `"INVOICE"`.
pub fn lookup(key: &str) -> Result<SequenceConfig> {
    let document_type: DocumentType = key.parse()?;
    Ok(sequence_config(document_type))
}

/// Formats `sequence` as `PREFIX-000NN`. Values wider than `padding` are
/// never truncated.
pub fn format_code(prefix: &str, sequence: i64, padding: usize) -> String {
    format!("{prefix}-{sequence:0padding$}")
}

/// Current state of one counter, keyed by short name in
/// [`SequenceGenerator::counter_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterStats {
    pub current_sequence: i64,
    pub prefix: String,
    pub last_generated_at: DateTime<Utc>,
}

/// Outcome of one entry of [`SequenceGenerator::bulk_reset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResetOutcome {
    Reset { new_sequence: i64 },
    Failed { error: String },
}

impl ResetOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResetOutcome::Reset { .. })
    }
}

/// Issues document codes.
///
/// Codes are generated inside the caller's transaction, so a rolled back
/// document creation never consumes a sequence value.
#[derive(Clone)]
pub struct SequenceGenerator<S> {
    store: S,
    padding: usize,
}

impl<S> SequenceGenerator<S>
where
    S: SequenceStore + DocumentStore,
{
    pub fn new(store: S) -> Self {
        Self::with_padding(store, DEFAULT_PADDING)
    }

    pub fn with_padding(store: S, padding: usize) -> Self {
        Self { store, padding }
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Increments the counter of `document_type` and formats the new value
    /// with the generator's padding.
    pub async fn generate_next_id(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
    ) -> Result<String> {
        self.generate_next_id_padded(tx, tenant_id, document_type, self.padding)
            .await
    }

    /// Same as [`generate_next_id`](Self::generate_next_id) with the code
    /// zero-padded to `padding` digits instead.
    #[tracing::instrument(skip(self, tx))]
    pub async fn generate_next_id_padded(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
        padding: usize,
    ) -> Result<String> {
        let config = sequence_config(document_type);
        let sequence = self
            .store
            .increment_and_get(tx, tenant_id, document_type, config.prefix)
            .await?;

        metrics::counter!("ledger_sequence_generated_total", "document_type" => config.short_name)
            .increment(1);
        Ok(format_code(config.prefix, sequence, padding))
    }

    /// Same as [`generate_next_id`](Self::generate_next_id) for a registry
    /// key given as a string.
    pub async fn generate_next_id_for(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<String> {
        let config = lookup(key)?;
        self.generate_next_id(tx, tenant_id, config.document_type).await
    }

    /// Generates a code no existing document of the same tenant and type
    /// carries yet.
    ///
    /// A counter that was reset below codes already in use would otherwise
    /// hand them out again.
    #[tracing::instrument(skip(self, tx))]
    pub async fn generate_unique_id(
        &self,
        tx: &mut S::Tx,
        tenant_id: TenantId,
        document_type: DocumentType,
    ) -> Result<String> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = self.generate_next_id(tx, tenant_id, document_type).await?;
            if !self
                .store
                .code_exists(tx, tenant_id, document_type, &code)
                .await?
            {
                return Ok(code);
            }
            tracing::warn!(%code, attempt, "generated code already in use");
        }

        Err(LedgerError::SequenceExhausted {
            tenant_id,
            document_type,
            attempts: MAX_CODE_ATTEMPTS,
        })
    }

    /// Returns the last issued sequence value, 0 if none was issued yet.
    pub async fn current_sequence(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
    ) -> Result<i64> {
        Ok(self.store.peek(tenant_id, document_type).await?)
    }

    /// Overwrites a counter. Not serialized against concurrent generation.
    #[tracing::instrument(skip(self))]
    pub async fn reset_sequence(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        new_sequence: i64,
    ) -> Result<()> {
        if new_sequence < 0 {
            return Err(LedgerError::InvalidSequence(new_sequence));
        }

        let config = sequence_config(document_type);
        self.store
            .reset(tenant_id, document_type, config.prefix, new_sequence)
            .await?;
        tracing::info!(%tenant_id, %document_type, new_sequence, "sequence reset");
        Ok(())
    }

    /// Resets several counters given by registry key. A failing entry is
    /// reported in the result and does not stop the others.
    pub async fn bulk_reset(
        &self,
        tenant_id: TenantId,
        sequences: &BTreeMap<String, i64>,
    ) -> BTreeMap<String, ResetOutcome> {
        let mut results = BTreeMap::new();

        for (key, &new_sequence) in sequences {
            let outcome = match lookup(key) {
                Ok(config) => self
                    .reset_sequence(tenant_id, config.document_type, new_sequence)
                    .await
                    .map(|()| ResetOutcome::Reset { new_sequence }),
                Err(e) => Err(e),
            }
            .unwrap_or_else(|e| ResetOutcome::Failed {
                error: e.to_string(),
            });
            results.insert(key.clone(), outcome);
        }

        results
    }

    /// All counters of the tenant, in registry order.
    pub async fn list_counters(&self, tenant_id: TenantId) -> Result<Vec<ledger_store::Counter>> {
        Ok(self.store.list_counters(tenant_id).await?)
    }

    /// Per short name: current sequence, prefix and last generation time.
    pub async fn counter_stats(
        &self,
        tenant_id: TenantId,
    ) -> Result<BTreeMap<String, CounterStats>> {
        let counters = self.list_counters(tenant_id).await?;

        Ok(counters
            .into_iter()
            .map(|counter| {
                let short_name = sequence_config(counter.document_type).short_name;
                (
                    short_name.to_string(),
                    CounterStats {
                        current_sequence: counter.sequence,
                        prefix: counter.prefix,
                        last_generated_at: counter.last_generated_at,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use ledger_store::{Document, DocumentBody, InMemoryLedgerStore, TransactionalStore};

    use super::*;

    fn generator() -> SequenceGenerator<InMemoryLedgerStore> {
        SequenceGenerator::new(InMemoryLedgerStore::new())
    }

    #[test]
    fn test_registry_prefixes() {
        assert_eq!(sequence_config(DocumentType::Invoice).prefix, "INV");
        assert_eq!(sequence_config(DocumentType::Bill).prefix, "BILL");
        assert_eq!(
            sequence_config(DocumentType::ProductionOrder).prefix,
            "Production_Order"
        );
        assert_eq!(sequence_config(DocumentType::PurchaseOrder).short_name, "purchase_order");
        assert!(matches!(
            lookup("LEDGER"),
            Err(LedgerError::UnknownDocumentType(_))
        ));
    }

    #[test]
    fn test_format_code() {
        assert_eq!(format_code("INV", 1, 5), "INV-00001");
        assert_eq!(format_code("PO", 42, 3), "PO-042");
        assert_eq!(format_code("CUS", 123456, 5), "CUS-123456");
        assert_eq!(format_code("REC", 7, 0), "REC-7");
    }

    #[tokio::test]
    async fn test_generate_next_id_sequence() {
        let generator = generator();
        let store = generator.store.clone();
        let tenant_id = TenantId::new();

        let mut tx = store.begin().await.unwrap();
        let first = generator
            .generate_next_id(&mut tx, tenant_id, DocumentType::Invoice)
            .await
            .unwrap();
        let second = generator
            .generate_next_id_for(&mut tx, tenant_id, "INVOICE")
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(first, "INV-00001");
        assert_eq!(second, "INV-00002");
        assert_eq!(
            generator
                .current_sequence(tenant_id, DocumentType::Invoice)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_padding_can_be_overridden_per_call() {
        let generator = generator();
        let store = generator.store.clone();
        let tenant_id = TenantId::new();

        let mut tx = store.begin().await.unwrap();
        let padded = generator
            .generate_next_id_padded(&mut tx, tenant_id, DocumentType::Quote, 3)
            .await
            .unwrap();
        let default = generator
            .generate_next_id(&mut tx, tenant_id, DocumentType::Quote)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(padded, "QUO-001");
        assert_eq!(default, "QUO-00002");
    }

    #[tokio::test]
    async fn test_unknown_key_fails_before_touching_counters() {
        let generator = generator();
        let store = generator.store.clone();
        let tenant_id = TenantId::new();

        let mut tx = store.begin().await.unwrap();
        let result = generator
            .generate_next_id_for(&mut tx, tenant_id, "WIDGET")
            .await;

        assert!(matches!(result, Err(LedgerError::UnknownDocumentType(_))));
        assert!(store.list_counters(tenant_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_id_skips_codes_in_use() {
        let generator = generator();
        let store = generator.store.clone();
        let tenant_id = TenantId::new();

        let mut tx = store.begin().await.unwrap();
        store
            .insert_document(
                &mut tx,
                &Document::new(tenant_id, "BILL-00001", DocumentBody::Bill { items: vec![] }),
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let code = generator
            .generate_unique_id(&mut tx, tenant_id, DocumentType::Bill)
            .await
            .unwrap();
        assert_eq!(code, "BILL-00002");
    }

    #[tokio::test]
    async fn test_unique_id_gives_up_after_three_collisions() {
        let generator = generator();
        let store = generator.store.clone();
        let tenant_id = TenantId::new();

        let mut tx = store.begin().await.unwrap();
        for n in 1..=3 {
            let code = format_code("BILL", n, 5);
            store
                .insert_document(
                    &mut tx,
                    &Document::new(tenant_id, code, DocumentBody::Bill { items: vec![] }),
                )
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let result = generator
            .generate_unique_id(&mut tx, tenant_id, DocumentType::Bill)
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::SequenceExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_and_bulk_reset() {
        let generator = generator();
        let tenant_id = TenantId::new();

        generator
            .reset_sequence(tenant_id, DocumentType::Payment, 99)
            .await
            .unwrap();
        assert!(matches!(
            generator
                .reset_sequence(tenant_id, DocumentType::Payment, -1)
                .await,
            Err(LedgerError::InvalidSequence(-1))
        ));

        let request: BTreeMap<String, i64> = [
            ("CUSTOMER".to_string(), 10),
            ("WIDGET".to_string(), 3),
            ("RECEIPT".to_string(), -2),
        ]
        .into_iter()
        .collect();
        let results = generator.bulk_reset(tenant_id, &request).await;

        assert_eq!(results["CUSTOMER"], ResetOutcome::Reset { new_sequence: 10 });
        assert!(!results["WIDGET"].is_success());
        assert!(!results["RECEIPT"].is_success());

        let stats = generator.counter_stats(tenant_id).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["customer"].current_sequence, 10);
        assert_eq!(stats["payment"].prefix, "PAY");
    }
}
