//! Provider credential configuration.

use crate::dtos::{ApiResponse, ProviderConfigRequest, ProviderConfigResponse};
use crate::models::ProviderConfig;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use service_core::error::AppError;

/// Store (or replace) the PSD2 provider credentials for a company.
pub async fn set_provider_config(
    State(state): State<AppState>,
    Json(payload): Json<ProviderConfigRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProviderConfigResponse>>), AppError> {
    if payload.api_url.trim().is_empty() || payload.client_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "apiUrl and clientId are required"
        )));
    }
    // mTLS material comes as a pair or not at all.
    if payload.cert_path.is_some() != payload.key_path.is_some() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "certPath and keyPath must be provided together"
        )));
    }

    let cfg = ProviderConfig {
        company_id: payload.company_id,
        api_url: payload.api_url.trim_end_matches('/').to_string(),
        client_id: payload.client_id,
        client_secret: payload.client_secret,
        redirect_uri: payload.redirect_uri,
        cert_path: payload.cert_path,
        key_path: payload.key_path,
        updated_utc: Utc::now(),
    };

    tracing::info!(company_id = %cfg.company_id, "Storing provider configuration");
    state.store.upsert_provider_config(&cfg).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(ProviderConfigResponse {
            company_id: cfg.company_id,
            api_url: cfg.api_url,
            client_id: cfg.client_id,
            redirect_uri: cfg.redirect_uri,
            mtls_configured: cfg.cert_path.is_some(),
        })),
    ))
}
