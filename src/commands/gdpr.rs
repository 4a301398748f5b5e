use std::sync::Arc;

use anyhow::{Context, Result};

use tracedock::gdpr::{EraseSelector, GdprService};
use tracedock::object_store::{parse_object_url, S3ObjectStore};
use tracedock::postgres::PostgresTraceStore;
use tracedock::store::ObjectStore;

const SALT_ENV: &str = "TRACEDOCK_PII_SALT";
const DEFAULT_RETENTION_DAYS: i64 = 90;

async fn service(database_url: &str) -> Result<GdprService> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let salt = std::env::var(SALT_ENV).unwrap_or_default();
    Ok(GdprService::new(
        Arc::new(PostgresTraceStore::new(pool)),
        &salt,
        DEFAULT_RETENTION_DAYS,
    ))
}

/* ============================= ERASE ============================= */

pub async fn erase(
    database_url: &str,
    subject: Option<&str>,
    correlation: Option<&str>,
    delete_objects: bool,
    user: &str,
) -> Result<()> {
    let selector = match (subject, correlation) {
        (Some(subject), _) => EraseSelector::Subject(subject),
        (None, Some(correlation)) => EraseSelector::Correlation(correlation),
        (None, None) => anyhow::bail!("provide --subject or --correlation"),
    };

    let service = service(database_url).await?;
    let outcome = service
        .erase(user, selector, "erasure request", "GDPR Art. 17")
        .await
        .context("Erasure failed")?;

    println!("Erased {} records, {} detections.", outcome.records_deleted, outcome.detections_deleted);

    if outcome.payload_urls.is_empty() {
        return Ok(());
    }

    if delete_objects {
        let store = S3ObjectStore::from_env().await;
        let mut deleted = 0;
        for url in &outcome.payload_urls {
            if let Some((bucket, key)) = parse_object_url(url) {
                match store.delete_object(bucket, key).await {
                    Ok(()) => deleted += 1,
                    Err(e) => eprintln!("  failed to delete {url}: {e}"),
                }
            }
        }
        println!("Deleted {deleted} of {} payload objects.", outcome.payload_urls.len());
    } else {
        println!("{} payload objects still referenced:", outcome.payload_urls.len());
        for url in &outcome.payload_urls {
            println!("  {url}");
        }
        println!("Re-run with --delete-objects to remove them.");
    }
    Ok(())
}

/* ============================= EXPORT ============================= */

pub async fn export(database_url: &str, subject: &str, user: &str) -> Result<()> {
    let service = service(database_url).await?;
    let records = service
        .export(user, subject, "portability request", "GDPR Art. 20")
        .await
        .context("Export failed")?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/* ============================= PSEUDONYMIZE ============================= */

pub async fn pseudonymize(database_url: &str, subject: &str, user: &str) -> Result<()> {
    let service = service(database_url).await?;
    let touched = service
        .pseudonymize(user, subject, "pseudonymization request", "GDPR Art. 17")
        .await
        .context("Pseudonymization failed")?;
    println!("Pseudonymized {touched} records for subject '{subject}'.");
    Ok(())
}
