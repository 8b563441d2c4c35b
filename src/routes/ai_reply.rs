use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppResult,
    middleware::{AdminUser, AuthUser},
    models::{
        AIReplyLog, AIReplySettings, AuditAction, CreateAuditLog, ResourceType, Thread, ThreadAIState,
        UpdateAIReplySettings, UsageSummary,
    },
    routes::common::{ApiResponse, Pagination},
    utils::validate_request,
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/usage", get(get_usage))
        .route("/logs", get(list_logs))
        .route("/threads/{id}", get(get_thread_state))
        .route("/threads/{id}/toggle", put(toggle_thread))
        .route("/threads/{id}/handoff", post(handoff_thread))
        .route("/threads/{id}/reset", post(reset_thread))
}

async fn get_settings(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<ApiResponse<AIReplySettings>>> {
    let settings = state.store.get_ai_settings(auth_user.workspace_id).await?;
    Ok(ApiResponse::ok(settings))
}

async fn update_settings(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(payload): Json<UpdateAIReplySettings>,
) -> AppResult<Json<ApiResponse<AIReplySettings>>> {
    validate_request(&payload)?;

    let mut settings = state.store.get_ai_settings(admin.workspace_id).await?;
    payload.apply_to(&mut settings);
    state.store.upsert_ai_settings(&settings).await?;

    state
        .audit
        .record(CreateAuditLog {
            workspace_id: admin.workspace_id,
            actor: admin.actor(),
            action: AuditAction::AiSettingsUpdated,
            resource_type: ResourceType::AiSettings,
            resource_id: None,
            details: Some(json!({
                "allow_automation": settings.allow_automation,
                "provider": settings.provider,
                "model": settings.model,
                "sandbox_enabled": settings.sandbox_enabled,
                "monthly_token_cap": settings.monthly_token_cap,
            })),
        })
        .await;

    Ok(ApiResponse::ok(settings))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub days: Option<i64>,
}

async fn get_usage(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<UsageQuery>,
) -> AppResult<Json<ApiResponse<UsageSummary>>> {
    let settings = state.store.get_ai_settings(auth_user.workspace_id).await?;
    let summary = state
        .ai
        .usage()
        .summary(
            auth_user.workspace_id,
            query.days.unwrap_or(30),
            settings.monthly_token_cap,
            Utc::now(),
        )
        .await?;
    Ok(ApiResponse::ok(summary))
}

async fn list_logs(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(page): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<AIReplyLog>>>> {
    let (limit, offset) = page.resolve();
    let logs = state
        .store
        .list_ai_logs(auth_user.workspace_id, limit, offset)
        .await?;
    Ok(ApiResponse::ok(logs))
}

async fn get_thread_state(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ThreadAIState>>> {
    state.store.get_thread(auth_user.workspace_id, id).await?;
    let ai_state = state.store.get_thread_ai_state(auth_user.workspace_id, id).await?;
    Ok(ApiResponse::ok(ai_state))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

async fn toggle_thread(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ToggleRequest>,
) -> AppResult<Json<ApiResponse<Thread>>> {
    let thread = state
        .ai
        .set_thread_enabled(auth_user.workspace_id, id, payload.enabled, auth_user.actor())
        .await?;
    Ok(ApiResponse::ok(thread))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct HandoffRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

async fn handoff_thread(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<HandoffRequest>>,
) -> AppResult<Json<ApiResponse<ThreadAIState>>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    validate_request(&payload)?;

    let ai_state = state
        .ai
        .trigger_handoff(auth_user.workspace_id, id, payload.reason.as_deref(), auth_user.actor())
        .await?;
    Ok(ApiResponse::ok(ai_state))
}

async fn reset_thread(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ThreadAIState>>> {
    let ai_state = state
        .ai
        .reset_handoff(auth_user.workspace_id, id, auth_user.actor())
        .await?;
    Ok(ApiResponse::ok(ai_state))
}
