//! Banking dashboard endpoint.

use crate::dtos::ApiResponse;
use crate::services::dashboard::DashboardSummary;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Aggregated summary for a company: totals, recent activity, expense
/// breakdown. Served from stored data, never blocks on a bank call.
pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
) -> Result<Json<ApiResponse<DashboardSummary>>, AppError> {
    let summary = state.dashboard.summary(company_id).await?;
    Ok(Json(ApiResponse::ok(summary)))
}
