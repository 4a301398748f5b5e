use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use tracedock::gdpr::GdprService;
use tracedock::postgres::PostgresTraceStore;

pub async fn run(database_url: &str) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let service = GdprService::new(Arc::new(PostgresTraceStore::new(pool)), "", 90);

    let deleted = service
        .sweep_expired(Utc::now())
        .await
        .context("Retention sweep failed")?;
    println!("Retention sweep deleted {deleted} expired records.");
    Ok(())
}
