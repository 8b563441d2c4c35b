use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    middleware::{AdminUser, AuthUser},
    models::{AutomationRule, CreateAutomationRule, UpdateAutomationRule},
    routes::common::ApiResponse,
    utils::validate_request,
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/{id}", get(get_rule).put(update_rule).delete(delete_rule))
}

async fn list_rules(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<ApiResponse<Vec<AutomationRule>>>> {
    let rules = state.rules.list(auth_user.workspace_id).await?;
    Ok(ApiResponse::ok(rules))
}

async fn get_rule(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<AutomationRule>>> {
    let rule = state.rules.get(auth_user.workspace_id, id).await?;
    Ok(ApiResponse::ok(rule))
}

async fn create_rule(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(payload): Json<CreateAutomationRule>,
) -> AppResult<(StatusCode, Json<ApiResponse<AutomationRule>>)> {
    validate_request(&payload)?;

    let rule = state
        .rules
        .create(admin.workspace_id, admin.actor(), payload)
        .await?;

    Ok((StatusCode::CREATED, ApiResponse::ok(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAutomationRule>,
) -> AppResult<Json<ApiResponse<AutomationRule>>> {
    validate_request(&payload)?;

    let rule = state
        .rules
        .update(admin.workspace_id, id, admin.actor(), payload)
        .await?;

    Ok(ApiResponse::ok(rule))
}

async fn delete_rule(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.rules.delete(admin.workspace_id, id, admin.actor()).await?;
    Ok(StatusCode::NO_CONTENT)
}
