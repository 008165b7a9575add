//! Account listing, balance snapshots and transaction queries.

use crate::dtos::{ApiResponse, BalancesResponse, TransactionsQuery};
use crate::models::{BankAccount, BankTransaction};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

/// List the accounts discovered under a connection.
pub async fn list_accounts(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<BankAccount>>>, AppError> {
    // 404 on an unknown connection rather than an empty list.
    state.connections.get(connection_id).await?;
    let accounts = state.store.list_accounts(connection_id).await?;
    Ok(Json(ApiResponse::ok(accounts)))
}

/// Current balance snapshot. A stale snapshot triggers a sync first; when
/// the daily quota is already spent the stored snapshot is served as-is.
pub async fn get_balances(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<ApiResponse<BalancesResponse>>, AppError> {
    let account = fetch_account(&state, account_id).await?;

    let ttl = chrono::Duration::seconds(state.config.sync.balance_snapshot_ttl_secs);
    let stale = match account.last_sync_utc {
        Some(last) => Utc::now() - last > ttl,
        None => true,
    };

    if !stale {
        return Ok(Json(ApiResponse::ok(BalancesResponse::from_account(
            account, false,
        ))));
    }

    match state.sync.sync_connection(account.connection_id, None).await {
        Ok(_) => {
            let refreshed = fetch_account(&state, account_id).await?;
            Ok(Json(ApiResponse::ok(BalancesResponse::from_account(
                refreshed, true,
            ))))
        }
        // Quota spent: the stored snapshot is the best available answer.
        Err(AppError::RateLimited(reason, _)) => {
            tracing::info!(account_id = %account_id, reason = %reason,
                "Serving stored balance snapshot, sync quota reached");
            Ok(Json(ApiResponse::ok(BalancesResponse::from_account(
                account, false,
            ))))
        }
        Err(e) => Err(e),
    }
}

/// Transactions for an account, optionally windowed by booking date.
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<ApiResponse<Vec<BankTransaction>>>, AppError> {
    if let (Some(from), Some(to)) = (query.date_from, query.date_to) {
        if from > to {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "dateFrom must not be after dateTo"
            )));
        }
    }

    fetch_account(&state, account_id).await?;
    let transactions = state
        .store
        .list_account_transactions(account_id, query.date_from, query.date_to)
        .await?;
    Ok(Json(ApiResponse::ok(transactions)))
}

async fn fetch_account(state: &AppState, account_id: Uuid) -> Result<BankAccount, AppError> {
    state
        .store
        .get_account(account_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account not found")))
}
