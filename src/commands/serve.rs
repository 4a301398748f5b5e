use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::signal;
use tracing::info;

use tracedock::config::TracerConfig;
use tracedock::metrics;
use tracedock::middleware::{self, Tracer};
use tracedock::object_store::S3ObjectStore;
use tracedock::postgres::PostgresTraceStore;
use tracedock::store::{MemoryObjectStore, MemoryTraceStore, ObjectStore, TraceStore};

/* ============================= ENTRY ============================= */

pub async fn run(
    addr: &str,
    database_url: Option<&str>,
    use_s3: bool,
    bucket: &str,
    service_id: &str,
) -> Result<()> {
    println!("Starting example traced service...\n");

    print!("  Trace store ................. ");
    let trace_store: Arc<dyn TraceStore> = match database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            let store = PostgresTraceStore::new(pool);
            store.init_schema().await.context("Failed to apply trace schema")?;
            println!("postgres");
            Arc::new(store)
        }
        None => {
            println!("memory");
            Arc::new(MemoryTraceStore::new())
        }
    };

    print!("  Object store ................ ");
    let object_store: Arc<dyn ObjectStore> = if use_s3 {
        println!("s3 ({bucket})");
        Arc::new(S3ObjectStore::from_env().await)
    } else {
        println!("memory ({bucket})");
        Arc::new(MemoryObjectStore::new())
    };

    let mut config = TracerConfig::new(service_id);
    config.object_bucket = bucket.to_string();
    let tracer = Tracer::new(config, trace_store, object_store);

    let addr: SocketAddr = addr.parse().context("Invalid listen address")?;
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /actions ............. Traced demo endpoint (send a JSON-LD action)");
    println!("    GET  /healthz ............. Liveness probe (always 200 OK)");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics scrape endpoint");
    println!();
    println!("Service running. Press Ctrl+C to stop.\n");

    let app = build_router(tracer.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind HTTP server")?;
    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Draining exporter...");
    let unsent = tracer.shutdown(Duration::from_secs(10)).await;
    println!("Service stopped ({unsent} records unsent).");
    Ok(())
}

/* ============================= ROUTER ============================= */

pub fn build_router(tracer: Arc<Tracer>) -> Router {
    Router::new()
        .route("/actions", post(actions_handler))
        .layer(axum::middleware::from_fn_with_state(tracer, middleware::trace))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "READY") }))
        .route("/metrics", get(metrics_handler))
}

/// Demo handler: acknowledges any JSON-LD action with a result object so the
/// extractor has something to project.
async fn actions_handler(Json(action): Json<Value>) -> impl IntoResponse {
    let action_type = action
        .get("@type")
        .and_then(|t| t.as_str())
        .unwrap_or("Action")
        .to_string();
    Json(json!({
        "result": {
            "accepted": true,
            "actionType": action_type,
        }
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_text() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}
