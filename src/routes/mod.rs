mod ai_reply;
mod audit;
mod automations;
pub mod common;
pub mod health;
mod scheduled_actions;
pub mod webhook;

use axum::{middleware, Router};

use crate::{middleware::rate_limit_middleware, AppState};

/// Combine all API routes
pub fn api_routes(state: AppState) -> Router<AppState> {
    let management = Router::new()
        .nest("/automations", automations::routes())
        .nest("/scheduled-actions", scheduled_actions::routes())
        .nest("/ai-reply", ai_reply::routes())
        .merge(audit::routes())
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware));

    Router::new()
        .merge(health::routes())
        .nest("/webhooks", webhook::routes())
        .merge(management)
}
