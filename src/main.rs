use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use inboxpilot::{build_router, config::Config, create_app, Components};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; LOG_FORMAT=json switches to structured output
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inboxpilot=debug,tower_http=debug".into()),
        )
        .with(fmt_layer)
        .init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting InboxPilot server on {}:{}", config.host, config.port);

    let Components {
        state,
        worker,
        scheduler,
        jobs,
    } = create_app(config.clone()).await?;

    let cancel = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(jobs));
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    let limiter = state.rate_limiter.clone();
    let sweep_cancel = cancel.clone();
    let sweep_every = Duration::from_secs(config.rate_limit_window_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = ticker.tick() => limiter.sweep().await,
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;

    tracing::info!("InboxPilot server running at http://{}:{}", config.host, config.port);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    // The router (and its job sender) is dropped by now, so the worker
    // drains whatever is queued and exits.
    cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler task panicked");
    }
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "Webhook worker task panicked");
    }

    Ok(())
}
