//! Category rule CRUD.

use crate::dtos::{ApiResponse, CreateRuleRequest, ListRulesQuery, UpdateRuleRequest};
use crate::models::CategoryRule;
use crate::services::categorize::CategorizationEngine;
use crate::services::store::RuleUpdate;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

pub async fn list_rules(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<ApiResponse<Vec<CategoryRule>>>, AppError> {
    let rules = state.store.list_rules(company_id, query.active_only).await?;
    Ok(Json(ApiResponse::ok(rules)))
}

/// Create a rule. Takes effect for transactions categorized afterwards;
/// already-stored transactions are never re-evaluated.
pub async fn create_rule(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    Json(payload): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CategoryRule>>), AppError> {
    CategorizationEngine::validate_pattern(&payload.pattern, payload.is_regex)?;
    if payload.category.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Category must not be empty"
        )));
    }

    let rule = CategoryRule {
        rule_id: Uuid::new_v4(),
        company_id,
        name: payload.name,
        pattern: payload.pattern,
        is_regex: payload.is_regex,
        field: payload.field.as_str().to_string(),
        category: payload.category,
        priority: payload.priority,
        is_active: payload.is_active,
        created_utc: Utc::now(),
    };

    tracing::info!(rule_id = %rule.rule_id, company_id = %company_id, "Creating category rule");
    state.store.create_rule(&rule).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(rule))))
}

/// Partial rule update; the target rule id travels in the body.
pub async fn update_rule(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    Json(payload): Json<UpdateRuleRequest>,
) -> Result<Json<ApiResponse<CategoryRule>>, AppError> {
    if let Some(pattern) = &payload.pattern {
        // Validate against the post-update regex flag.
        let is_regex = match payload.is_regex {
            Some(flag) => flag,
            None => {
                let existing = state
                    .store
                    .list_rules(company_id, false)
                    .await?
                    .into_iter()
                    .find(|r| r.rule_id == payload.rule_id)
                    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule not found")))?;
                existing.is_regex
            }
        };
        CategorizationEngine::validate_pattern(pattern, is_regex)?;
    }

    let update = RuleUpdate {
        name: payload.name,
        pattern: payload.pattern,
        is_regex: payload.is_regex,
        field: payload.field,
        category: payload.category,
        priority: payload.priority,
        is_active: payload.is_active,
    };

    let rule = state
        .store
        .update_rule(company_id, payload.rule_id, update)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule not found")))?;
    Ok(Json(ApiResponse::ok(rule)))
}
