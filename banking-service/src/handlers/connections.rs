//! Consent creation and bank connection lifecycle endpoints.

use crate::dtos::{
    ApiResponse, ConnectionResponse, CreateConsentRequest, CreateConsentResponse, SyncRequest,
    SyncResponse,
};
use crate::services::consent::ConsentDraft;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Submit a consent to the bank and create a pending connection.
/// The response carries the SCA redirect the user must complete.
pub async fn create_consent(
    State(state): State<AppState>,
    Json(payload): Json<CreateConsentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CreateConsentResponse>>), AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Connection name is required"
        )));
    }

    let draft = ConsentDraft {
        company_id: payload.company_id,
        access: payload.access,
        recurring_indicator: payload.recurring_indicator,
        frequency_per_day: payload.frequency_per_day,
        valid_until: payload.valid_until,
    };

    let created = state
        .connections
        .create(payload.name.trim(), &payload.provider, draft)
        .await?;

    let consent_id = created.connection.consent_id.clone();
    let consent = state.store.get_consent(&consent_id).await?.ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("Consent vanished after creation"))
    })?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(CreateConsentResponse {
            connection: created.connection.into(),
            consent_id,
            consent_status: consent.status,
            sca_redirect: created.sca_redirect,
        })),
    ))
}

/// List all connections for a company.
pub async fn list_connections(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<ConnectionResponse>>>, AppError> {
    let connections = state.connections.list(company_id).await?;
    Ok(Json(ApiResponse::ok(
        connections.into_iter().map(ConnectionResponse::from).collect(),
    )))
}

/// Re-query the bank for the consent status and apply the resulting
/// transition. Activation triggers a best-effort initial sync.
pub async fn refresh_status(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ConnectionResponse>>, AppError> {
    let outcome = state.connections.refresh_status(connection_id).await?;

    if outcome.activated {
        if let Err(e) = state.sync.sync_connection(connection_id, None).await {
            tracing::warn!(
                connection_id = %connection_id,
                error = %e,
                "Initial sync after activation failed; will retry on next sync"
            );
        }
    }

    Ok(Json(ApiResponse::ok(outcome.connection.into())))
}

/// Revoke a connection and its consent.
pub async fn revoke_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ConnectionResponse>>, AppError> {
    let connection = state.connections.revoke(connection_id).await?;
    Ok(Json(ApiResponse::ok(connection.into())))
}

/// Trigger a sync of all accounts under a connection.
pub async fn sync_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
    payload: Option<Json<SyncRequest>>,
) -> Result<Json<ApiResponse<SyncResponse>>, AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or(SyncRequest {
        date_from: None,
        date_to: None,
    });
    let window = match (payload.date_from, payload.date_to) {
        (Some(from), Some(to)) if from <= to => Some((from, to)),
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "dateFrom must not be after dateTo"
            )))
        }
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "dateFrom and dateTo must be provided together"
            )))
        }
    };

    let outcome = state.sync.sync_connection(connection_id, window).await?;
    Ok(Json(ApiResponse::ok(SyncResponse {
        accounts_synced: outcome.accounts_synced,
        transactions_inserted: outcome.transactions_inserted,
    })))
}
