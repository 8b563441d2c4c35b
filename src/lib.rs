pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::{
    config::Config,
    middleware::{MemoryRateLimitStore, RateLimitStore, RedisRateLimitStore},
    services::{
        pipeline_service::{job_channel, JobReceiver, JobSender},
        AiReplyService, AuditService, AuthService, AutomationEngine, MessageSender, PipelineWorker,
        ProviderRegistry, RuleService, Scheduler, SlaBudgets, SlaService, WhatsAppCloudSender,
    },
    store::{PgStore, Store},
};

/// Webhook bodies larger than this are rejected before verification
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub auth: AuthService,
    pub audit: AuditService,
    pub rules: RuleService,
    pub ai: AiReplyService,
    pub rate_limiter: Arc<dyn RateLimitStore>,
    pub webhook_tx: JobSender,
}

/// Everything `main` needs to run: shared state plus the background
/// workers that consume it
pub struct Components {
    pub state: AppState,
    pub worker: PipelineWorker,
    pub scheduler: Scheduler,
    pub jobs: JobReceiver,
}

/// Wire services around the given collaborators
pub fn assemble(
    config: Config,
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    sender: Arc<dyn MessageSender>,
    rate_limiter: Arc<dyn RateLimitStore>,
) -> Components {
    let audit = AuditService::new(store.clone());
    let sla = SlaService::new(SlaBudgets::from_config(&config));
    let engine = AutomationEngine::new(store.clone(), audit.clone(), sender.clone());
    let ai = AiReplyService::new(
        store.clone(),
        providers,
        sender,
        audit.clone(),
        Duration::from_secs(config.ai_provider_timeout_secs.max(1)),
    );
    let worker = PipelineWorker::new(
        store.clone(),
        sla.clone(),
        engine.clone(),
        ai.clone(),
        audit.clone(),
        &config,
    );
    let scheduler = Scheduler::new(store.clone(), engine, sla, audit.clone(), worker.clone(), &config);
    let (webhook_tx, jobs) = job_channel(config.webhook_queue_capacity);

    let state = AppState {
        auth: AuthService::new(config.jwt_secret.clone()),
        rules: RuleService::new(store.clone(), audit.clone()),
        store,
        config,
        audit,
        ai,
        rate_limiter,
        webhook_tx,
    };

    Components {
        state,
        worker,
        scheduler,
        jobs,
    }
}

/// Build the HTTP router for a state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes::api_routes(state.clone()))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Connect production collaborators and assemble the application
pub async fn create_app(config: Config) -> Result<Components> {
    // Create database connection pool
    let db = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    let store = PgStore::new(db);
    store.migrate().await?;

    let rate_limiter: Arc<dyn RateLimitStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Using Redis rate limit store");
            Arc::new(RedisRateLimitStore::connect(url).await?)
        }
        None => Arc::new(MemoryRateLimitStore::new()),
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.ai_provider_timeout_secs.max(1) + 5))
        .build()?;
    let providers = ProviderRegistry::from_config(&config, client.clone());
    let sender: Arc<dyn MessageSender> = Arc::new(WhatsAppCloudSender::from_config(&config, client));

    Ok(assemble(config, Arc::new(store), providers, sender, rate_limiter))
}
