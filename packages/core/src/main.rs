use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use anomaly_sync::aggregation::AggregationEngine;
use anomaly_sync::api::{self, AppState};
use anomaly_sync::cache::{spawn_warm_up, HotCache};
use anomaly_sync::cli::Cli;
use anomaly_sync::config::Config;
use anomaly_sync::db;
use anomaly_sync::error::AppError;
use anomaly_sync::logging::init_logging;
use anomaly_sync::metrics::AppMetrics;
use anomaly_sync::remote::HttpRemoteSource;
use anomaly_sync::repository::Repository;
use anomaly_sync::scheduler::run_sync_schedule;
use anomaly_sync::sync::{EventBus, SyncOrchestrator};

fn exit_with(err: AppError) -> ! {
    tracing::error!("{}", err);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()
        .and_then(|mut config| config.apply_cli(&cli).map(|_| config))
        .map_err(AppError::Config)
        .unwrap_or_else(|err| exit_with(err));

    tracing::info!(
        "Starting anomaly-sync (remote: {}, interval: {}s, retention: {}d)",
        config.remote_url,
        config.sync_interval_seconds,
        config.retention_days
    );

    let pool = db::create_pool(&config.database_url)
        .await
        .map_err(|err| AppError::Config(format!("database: {}", err)))
        .unwrap_or_else(|err| exit_with(err));
    let repo = Repository::new(pool);

    let calendar = config
        .calendar()
        .map(Arc::new)
        .map_err(AppError::from)
        .unwrap_or_else(|err| exit_with(err));
    let metrics = AppMetrics::new()
        .map(Arc::new)
        .map_err(|err| AppError::Config(format!("metrics: {}", err)))
        .unwrap_or_else(|err| exit_with(err));

    let shutdown = CancellationToken::new();
    let pools = config.worker_pools();

    let cache = Arc::new(HotCache::default());
    spawn_warm_up(
        cache.clone(),
        repo.clone(),
        Utc::now() - config.retention(),
        shutdown.child_token(),
    );

    let engine = Arc::new(
        AggregationEngine::new(repo.clone(), cache.clone(), config.aggregation())
            .with_calendar(calendar.clone())
            .with_metrics(metrics.clone()),
    );

    let remote = Arc::new(HttpRemoteSource::new(
        config.remote_url.clone(),
        config.remote_api_key.clone(),
    ));
    let orchestrator = Arc::new(
        SyncOrchestrator::new(
            repo.clone(),
            cache.clone(),
            engine.clone(),
            remote,
            EventBus::default(),
            config.sync_settings(),
        )
        .with_pools(pools.clone())
        .with_metrics(metrics.clone()),
    );
    if let Err(err) = orchestrator.restore().await {
        tracing::warn!("Could not restore sync settings: {}", err);
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    let scheduler = tokio::spawn(run_sync_schedule(
        orchestrator.clone(),
        config.sync_interval_seconds,
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        repo,
        cache,
        engine,
        calendar,
        orchestrator,
        pools,
        metrics,
        shutdown: shutdown.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Config(format!("cannot bind {}: {}", addr, err)))
        .unwrap_or_else(|err| exit_with(err));
    tracing::info!("HTTP API listening on {}", addr);

    if let Err(err) = axum::serve(listener, api::create_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        tracing::error!("HTTP server error: {}", err);
        shutdown.cancel();
    }

    if scheduler.await.is_err() {
        tracing::warn!("Sync scheduler task ended abnormally");
    }
    tracing::info!("Service stopped");
}
