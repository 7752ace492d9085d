use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Extension, Json, Router};
use chrono::NaiveDate;
use mongodb::{options::ClientOptions, Client as MongoClient};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

mod clients;
mod config;
mod lock;
mod mapping;
mod media;
mod models;
mod storage;
mod sync;
mod warehouse;

use crate::clients::{KizeoClient, RedisLockStore};
use crate::config::Config;
use crate::lock::LockStore;
use crate::media::S3MediaStore;
use crate::models::IngestionError;
use crate::storage::{ConfigStore, MongoStateStore};
use crate::sync::IngestionEngine;
use crate::warehouse::{bigquery::BigQueryClient, WarehouseGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load this crate's .env regardless of the current working directory.
    let _ = dotenvy::from_filename_override(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));

    let filter = EnvFilter::from_default_env().add_directive("info".parse().unwrap());
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .init();

    let cfg = Config::from_env();
    tracing::info!(
        database = %cfg.database_name,
        scheduler_enabled = cfg.enable_scheduler,
        warehouse_configured = cfg.warehouse_project_id.is_some(),
        "Loaded configuration"
    );

    let client_options = ClientOptions::parse(&cfg.mongodb_uri).await?;
    let mongo_client = MongoClient::with_options(client_options)?;
    let db = mongo_client.database(&cfg.database_name);
    let store: Arc<dyn ConfigStore> = Arc::new(MongoStateStore::with_db(db));

    let locks: Arc<dyn LockStore> = Arc::new(RedisLockStore::new(&cfg.redis_url).await?);

    let forms = Arc::new(KizeoClient::new(
        cfg.forms_base_url.clone(),
        cfg.forms_api_token.clone(),
        cfg.http_timeout_ms,
        &cfg.http_user_agent,
        cfg.http_max_retries,
        cfg.http_retry_backoff_ms,
    ));

    let mut engine = IngestionEngine::new(forms.clone(), store.clone(), locks.clone())
        .with_timezone(cfg.timezone())
        .with_options(cfg.engine_options());

    if let Some(warehouse_config) = cfg.warehouse_config() {
        let token = cfg.warehouse_token.clone().unwrap_or_default();
        let client = BigQueryClient::new(
            warehouse_config,
            token,
            cfg.http_timeout_ms,
            &cfg.http_user_agent,
        );
        engine = engine.with_gateway(WarehouseGateway::new(Arc::new(client)));
    } else {
        tracing::warn!("No warehouse project configured; ingestion targets are disabled");
    }

    if cfg.media_enabled {
        let media = S3MediaStore::new(&cfg, forms.clone()).await?;
        engine = engine.with_media(Arc::new(media));
    }

    // Kept alive for the lifetime of the process; dropping the handle would
    // stop the cron loop.
    let _scheduler = if cfg.enable_scheduler {
        let scheduler = start_run_scheduler(engine.clone(), store.clone()).await?;
        tracing::info!("Run scheduler started");
        Some(scheduler)
    } else {
        None
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/runs/{scope}", post(trigger_run).get(recent_runs))
        .route("/backfill/{scope}", post(trigger_backfill))
        .route("/locks/{scope}/release", post(force_release_lock))
        .layer(Extension(engine))
        .layer(Extension(store))
        .layer(Extension(locks))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(port = cfg.port, "Forms ingestion service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

/// Manual trigger. A concurrent-run rejection is surfaced to the caller;
/// the scheduler treats the same condition as a silent skip.
async fn trigger_run(
    Extension(engine): Extension<IngestionEngine>,
    Path(scope): Path<String>,
) -> Response {
    match engine.run(&scope).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct BackfillParams {
    from: Option<String>,
    to: Option<String>,
}

async fn trigger_backfill(
    Extension(engine): Extension<IngestionEngine>,
    Path(scope): Path<String>,
    Query(params): Query<BackfillParams>,
) -> Response {
    let from = match parse_date(params.from.as_deref()) {
        Ok(d) => d,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    let to = match parse_date(params.to.as_deref()) {
        Ok(d) => d,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    match engine.backfill(&scope, from, to).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn recent_runs(
    Extension(store): Extension<Arc<dyn ConfigStore>>,
    Path(scope): Path<String>,
) -> Response {
    match store.recent_runs(&scope, 20).await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => error_response(e),
    }
}

/// Remediation endpoint for a lock left `enCours` by a killed run.
async fn force_release_lock(
    Extension(locks): Extension<Arc<dyn LockStore>>,
    Path(scope): Path<String>,
) -> Response {
    match locks.force_release(&scope).await {
        Ok(()) => Json(json!({ "scope": scope, "state": crate::lock::LOCK_IDLE })).into_response(),
        Err(e) => error_response(e),
    }
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match value {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("Invalid date '{s}', expected YYYY-MM-DD")),
    }
}

fn error_response(error: IngestionError) -> Response {
    let status = match &error {
        IngestionError::RunInProgress(_) => StatusCode::CONFLICT,
        IngestionError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// Every minute, walk the configurations and spawn runs for the ones whose
/// cron schedule is due. A run already holding the lock is skipped silently.
async fn start_run_scheduler(
    engine: IngestionEngine,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<tokio_cron_scheduler::JobScheduler> {
    use tokio_cron_scheduler::{Job, JobScheduler};

    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async("0 * * * * *", move |_uuid, _l| {
        let engine = engine.clone();
        let store = store.clone();
        Box::pin(async move {
            if let Err(e) = check_and_run_due_configs(engine, store).await {
                tracing::error!(error = %e, "Error checking due runs");
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

async fn check_and_run_due_configs(
    engine: IngestionEngine,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<()> {
    let configs = store.list_configs().await?;
    for config in configs {
        if config.trigger_frequency.trim().is_empty() || !config.is_due() {
            continue;
        }
        let engine = engine.clone();
        let scope = config.scope.clone();
        tokio::spawn(async move {
            match engine.run(&scope).await {
                Ok(_) => {}
                Err(IngestionError::RunInProgress(_)) => {
                    tracing::debug!(scope = %scope, "Scheduled run skipped; already in progress");
                }
                Err(e) => {
                    tracing::error!(scope = %scope, error = %e, "Scheduled run failed");
                }
            }
        });
    }
    Ok(())
}
