//! Strand scheduler entry point.
//!
//! Loads configuration, builds the core managers, restores persisted asset
//! machines, starts the election ticker, and serves the HTTP ingress that
//! the transport layer and operators drive.

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use common::{NodeType, ValidationInfo};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scheduler::api::{ReportError, Scheduler};
use scheduler::assets::{AssetManager, PullAssetRequest, UploadAssetRequest};
use scheduler::config;
use scheduler::metrics::Metrics;
use scheduler::node::NodeManager;
use scheduler::persist::MemStore;
use scheduler::validation::ValidationManager;
use scheduler::workload::WorkloadManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Strand scheduler - content delivery fleet controller")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_id = %config.server_id,
        listen_addr = %config.network.listen_addr,
        validator_ratio = config.election.validator_ratio,
        "scheduler starting"
    );

    let private_key = common::crypto::load_or_generate_private_key(
        &config.keys.private_key_path,
        config.keys.key_bits,
    )?;
    info!(path = %config.keys.private_key_path.display(), "scheduler key loaded");

    let metrics = Metrics::new();
    let store = Arc::new(MemStore::new());

    let nodes = Arc::new(NodeManager::new(
        store.clone(),
        metrics.clone(),
        config.server_id.clone(),
    ));
    let assets = Arc::new(AssetManager::new(
        nodes.clone(),
        store.clone(),
        config.assets.clone(),
        metrics.clone(),
    ));
    assets.restore().await?;

    let validation = Arc::new(ValidationManager::new(
        nodes.clone(),
        store.clone(),
        config.election.clone(),
        metrics.clone(),
    ));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(validation.clone().run(shutdown_rx));

    let workload = Arc::new(WorkloadManager::new(store.clone(), metrics.clone()));

    let listen_addr = config.network.listen_addr;
    let scheduler = Arc::new(Scheduler {
        nodes,
        assets,
        validation,
        persistence: store,
        workload,
        metrics,
        config,
        private_key: Some(private_key),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/public-key", get(public_key))
        .route("/report/workload/node", post(submit_node_workload))
        .route("/report/workload/user", post(submit_user_workload))
        .route("/validation/result", post(validation_result))
        .route("/validation/info", get(validation_info))
        .route("/election/trigger", post(trigger_election))
        .route("/election/compulsory", post(compulsory_election))
        .route("/assets", post(pull_asset))
        .route("/assets/upload", post(upload_asset))
        .route("/assets/progress", post(asset_progress))
        .route("/assets/:hash", delete(remove_asset))
        .route("/nodes/:id/disconnect", post(node_disconnect))
        .route("/workload/record/:token_id", get(workload_record))
        .route("/workload/records/:node_id", get(workload_records))
        .route("/validation/results/:node_id", get(validation_results))
        .route("/config/minio", get(minio_config))
        .with_state(scheduler);

    info!(addr = %listen_addr, "scheduler listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Transport-authenticated node identity, forwarded by the ingress proxy.
fn node_id(headers: &HeaderMap) -> Result<String, (StatusCode, String)> {
    headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or((StatusCode::BAD_REQUEST, "missing x-node-id".to_string()))
}

fn report_status(err: &ReportError) -> StatusCode {
    match err {
        ReportError::UnknownNode(_) => StatusCode::NOT_FOUND,
        ReportError::MissingKey => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(scheduler): State<Arc<Scheduler>>) -> String {
    scheduler.metrics.render()
}

async fn public_key(
    State(scheduler): State<Arc<Scheduler>>,
) -> Result<String, (StatusCode, String)> {
    scheduler
        .get_scheduler_public_key()
        .map_err(|e| (report_status(&e), e.to_string()))
}

async fn submit_node_workload(
    State(scheduler): State<Arc<Scheduler>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let node_id = node_id(&headers)?;
    scheduler
        .submit_node_workload_report(&node_id, &body)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (report_status(&e), e.to_string()))
}

async fn submit_user_workload(
    State(scheduler): State<Arc<Scheduler>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let node_id = node_id(&headers)?;
    scheduler
        .submit_user_workload_report(&node_id, &body)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (report_status(&e), e.to_string()))
}

async fn validation_result(
    State(scheduler): State<Arc<Scheduler>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let node_id = node_id(&headers)?;
    let sign = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::BAD_REQUEST, "missing x-signature".to_string()))?;
    scheduler
        .node_validation_result(&node_id, &body, sign)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (report_status(&e), e.to_string()))
}

async fn validation_info(State(scheduler): State<Arc<Scheduler>>) -> Json<ValidationInfo> {
    Json(scheduler.get_validation_info())
}

async fn trigger_election(State(scheduler): State<Arc<Scheduler>>) -> StatusCode {
    scheduler.trigger_election();
    StatusCode::ACCEPTED
}

async fn compulsory_election(
    State(scheduler): State<Arc<Scheduler>>,
    Json(validators): Json<Vec<String>>,
) -> Result<StatusCode, (StatusCode, String)> {
    scheduler
        .validation
        .compulsory_election(validators)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn pull_asset(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<PullAssetRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    scheduler
        .assets
        .pull_asset(req)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn upload_asset(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<UploadAssetRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    scheduler
        .assets
        .create_asset_upload(req)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(serde::Deserialize)]
struct PullProgress {
    hash: String,
    succeeded: bool,
}

/// A node reports the outcome of a dispatched pull. Whether it counts
/// against the candidate or edge targets follows from the node's registered
/// role, not from anything the node claims.
async fn asset_progress(
    State(scheduler): State<Arc<Scheduler>>,
    headers: HeaderMap,
    Json(progress): Json<PullProgress>,
) -> Result<StatusCode, (StatusCode, String)> {
    let node_id = node_id(&headers)?;
    let node = scheduler
        .nodes
        .get_node(&node_id)
        .ok_or((StatusCode::NOT_FOUND, format!("node {node_id} not found")))?;

    scheduler
        .assets
        .push_pull_result(
            &progress.hash,
            &node_id,
            node.node_type == NodeType::Candidate,
            progress.succeeded,
        )
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn remove_asset(
    State(scheduler): State<Arc<Scheduler>>,
    Path(hash): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    scheduler
        .assets
        .remove_asset(&hash)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(serde::Deserialize)]
struct Pagination {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn workload_record(
    State(scheduler): State<Arc<Scheduler>>,
    Path(token_id): Path<String>,
) -> Result<Json<common::WorkloadRecord>, (StatusCode, String)> {
    scheduler
        .get_workload_record(&token_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))
}

async fn workload_records(
    State(scheduler): State<Arc<Scheduler>>,
    Path(node_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<common::WorkloadRecord>>, (StatusCode, String)> {
    scheduler
        .get_workload_records(&node_id, page.limit.unwrap_or(100), page.offset.unwrap_or(0))
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn validation_results(
    State(scheduler): State<Arc<Scheduler>>,
    Path(node_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<common::ValidationResult>>, (StatusCode, String)> {
    scheduler
        .get_validation_results(&node_id, page.limit.unwrap_or(100), page.offset.unwrap_or(0))
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// The transport layer reports a dropped node connection. Asset machines
/// holding replicas on it schedule replenishment.
async fn node_disconnect(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> StatusCode {
    scheduler.node_disconnect(&id);
    StatusCode::OK
}

async fn minio_config(State(scheduler): State<Arc<Scheduler>>) -> Json<common::MinioConfig> {
    Json(scheduler.minio_config())
}
