use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use crate::{
    error::AppResult,
    middleware::AdminUser,
    models::{AuditLog, Escalation},
    routes::common::{ApiResponse, Pagination},
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/audit-logs", get(list_audit_logs))
        .route("/escalations", get(list_escalations))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(page): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<AuditLog>>>> {
    let (limit, offset) = page.resolve();
    let logs = state.audit.list(admin.workspace_id, limit, offset).await?;
    Ok(ApiResponse::ok(logs))
}

async fn list_escalations(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(page): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<Escalation>>>> {
    let (limit, _) = page.resolve();
    let escalations = state.store.list_escalations(admin.workspace_id, limit).await?;
    Ok(ApiResponse::ok(escalations))
}
