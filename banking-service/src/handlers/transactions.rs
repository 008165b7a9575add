//! Manual categorization and invoice linking.

use crate::dtos::{ApiResponse, CategorizeRequest, LinkInvoiceRequest};
use crate::models::BankTransaction;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Manual category override. Sets the manual flag so later rule changes
/// never touch this transaction.
pub async fn categorize_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(payload): Json<CategorizeRequest>,
) -> Result<Json<ApiResponse<BankTransaction>>, AppError> {
    let category = payload.category.trim();
    if category.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Category must not be empty"
        )));
    }

    let transaction = state
        .categorizer
        .categorize_manually(transaction_id, category)
        .await?;
    Ok(Json(ApiResponse::ok(transaction)))
}

/// Link a transaction to an invoice.
pub async fn link_invoice(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(payload): Json<LinkInvoiceRequest>,
) -> Result<Json<ApiResponse<BankTransaction>>, AppError> {
    state.linker.link(transaction_id, payload.invoice_id).await?;
    let transaction = state
        .store
        .get_transaction(transaction_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;
    Ok(Json(ApiResponse::ok(transaction)))
}
