//! Manual association between bank transactions and invoices.

use crate::services::store::BankingStore;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct TransactionLinker {
    store: Arc<dyn BankingStore>,
}

impl TransactionLinker {
    pub fn new(store: Arc<dyn BankingStore>) -> Self {
        Self { store }
    }

    /// Link a transaction to an invoice. Re-linking overwrites the previous
    /// association; linking the same pair twice is a no-op.
    #[instrument(skip(self))]
    pub async fn link(&self, transaction_id: Uuid, invoice_id: Uuid) -> Result<(), AppError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;

        if !self.store.invoice_exists(invoice_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!("Invoice not found")));
        }

        if transaction.invoice_id == Some(invoice_id) {
            return Ok(());
        }

        self.store.link_invoice(transaction_id, invoice_id).await?;
        info!(
            transaction_id = %transaction_id,
            invoice_id = %invoice_id,
            "Transaction linked to invoice"
        );
        Ok(())
    }
}
