use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::AuthUser,
    models::{
        AuditAction, CreateAuditLog, CreateScheduledAction, ResourceType, ScheduledAction,
        ScheduledActionStatus,
    },
    routes::common::{ApiResponse, Pagination},
    services::automation_service::validate_rule_definition,
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_actions).post(create_action))
        .route("/{id}", get(get_action))
        .route("/{id}/cancel", post(cancel_action))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<ScheduledActionStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

async fn list_actions(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ApiResponse<Vec<ScheduledAction>>>> {
    let (limit, offset) = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .resolve();
    let actions = state
        .store
        .list_scheduled_actions(auth_user.workspace_id, query.status, limit, offset)
        .await?;
    Ok(ApiResponse::ok(actions))
}

async fn get_action(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ScheduledAction>>> {
    let action = state.store.get_scheduled_action(auth_user.workspace_id, id).await?;
    Ok(ApiResponse::ok(action))
}

async fn create_action(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<CreateScheduledAction>,
) -> AppResult<(StatusCode, Json<ApiResponse<ScheduledAction>>)> {
    let thread_id = payload
        .thread_id
        .ok_or_else(|| AppError::Validation("thread_id is required".to_string()))?;
    validate_rule_definition(&[], std::slice::from_ref(&payload.action)).map_err(AppError::Validation)?;

    // Scopes the thread to the caller's workspace
    state.store.get_thread(auth_user.workspace_id, thread_id).await?;

    let action = ScheduledAction::new(
        auth_user.workspace_id,
        Some(thread_id),
        None,
        payload.run_at,
        payload.action,
    );
    state.store.insert_scheduled_action(&action).await?;

    state
        .audit
        .record(CreateAuditLog {
            workspace_id: auth_user.workspace_id,
            actor: auth_user.actor(),
            action: AuditAction::ActionScheduled,
            resource_type: ResourceType::ScheduledAction,
            resource_id: Some(action.id.to_string()),
            details: Some(json!({ "run_at": action.run_at, "action": action.action_type })),
        })
        .await;

    Ok((StatusCode::CREATED, ApiResponse::ok(action)))
}

async fn cancel_action(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ScheduledAction>>> {
    let action = state.store.cancel_scheduled_action(auth_user.workspace_id, id).await?;

    state
        .audit
        .record(CreateAuditLog {
            workspace_id: auth_user.workspace_id,
            actor: auth_user.actor(),
            action: AuditAction::ScheduledActionCancelled,
            resource_type: ResourceType::ScheduledAction,
            resource_id: Some(action.id.to_string()),
            details: None,
        })
        .await;

    Ok(ApiResponse::ok(action))
}
