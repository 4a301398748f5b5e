use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;

use crate::gdpr::AuditEvent;
use crate::pii::PiiDetection;
use crate::record::{ActionRecord, ActionStatus};
use crate::store::{StoreError, TraceStore};

/* ============================= STORE ============================= */

/// `TraceStore` over an injected sqlx Postgres pool. The pool's lifecycle
/// belongs to the caller; this type only issues queries.
pub struct PostgresTraceStore {
    pool: PgPool,
}

const SCHEMA: &str = include_str!("../sql/schema.sql");

impl PostgresTraceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema (idempotent). Creates the hypertable and retention
    /// policy when TimescaleDB is installed, then registers the extractor's
    /// metadata shapes.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        for (action_type, object_type, keys) in crate::extractor::known_shapes() {
            sqlx::query(
                "INSERT INTO action_metadata_schemas (action_type, object_type, metadata_keys)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (action_type, object_type)
                 DO UPDATE SET metadata_keys = EXCLUDED.metadata_keys",
            )
            .bind(action_type)
            .bind(object_type)
            .bind(Json(keys))
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        }
        Ok(())
    }

    async fn select_records(
        &self,
        where_clause: &str,
        param: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let sql = format!(
            "SELECT * FROM action_executions WHERE {where_clause} ORDER BY started_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(param)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        rows.iter().map(row_to_record).collect()
    }
}

fn sql_err(e: sqlx::Error) -> StoreError {
    StoreError::Sql(e.to_string())
}

/* ============================= ROW MAPPING ============================= */

fn status_from_str(s: &str) -> ActionStatus {
    match s {
        "Active" => ActionStatus::Active,
        "Failed" => ActionStatus::Failed,
        _ => ActionStatus::Completed,
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ActionRecord, StoreError> {
    let metadata: Json<Map<String, Value>> = row.try_get("metadata").map_err(sql_err)?;
    let tags: Json<BTreeSet<String>> = row.try_get("tags").map_err(sql_err)?;
    let status: String = row.try_get("action_status").map_err(sql_err)?;

    Ok(ActionRecord {
        correlation_id: row.try_get("correlation_id").map_err(sql_err)?,
        operation_id: row.try_get("operation_id").map_err(sql_err)?,
        parent_operation_id: row.try_get("parent_operation_id").map_err(sql_err)?,
        service_id: row.try_get("service_id").map_err(sql_err)?,
        action_type: row.try_get("action_type").map_err(sql_err)?,
        object_type: row.try_get("object_type").map_err(sql_err)?,
        started_at: row.try_get("started_at").map_err(sql_err)?,
        completed_at: row.try_get("completed_at").map_err(sql_err)?,
        duration_ms: row.try_get("duration_ms").map_err(sql_err)?,
        action_status: status_from_str(&status),
        error_message: row.try_get("error_message").map_err(sql_err)?,
        error_type: row.try_get("error_type").map_err(sql_err)?,
        request_url: row.try_get("request_url").map_err(sql_err)?,
        response_url: row.try_get("response_url").map_err(sql_err)?,
        logs_url: row.try_get("logs_url").map_err(sql_err)?,
        request_size_bytes: row.try_get("request_size_bytes").map_err(sql_err)?,
        response_size_bytes: row.try_get("response_size_bytes").map_err(sql_err)?,
        logs_size_bytes: row.try_get("logs_size_bytes").map_err(sql_err)?,
        metadata: metadata.0,
        tags: tags.0,
        otel_trace_id: row.try_get("otel_trace_id").map_err(sql_err)?,
        otel_span_id: row.try_get("otel_span_id").map_err(sql_err)?,
        data_subject_id: row.try_get("data_subject_id").map_err(sql_err)?,
        legal_basis: row.try_get("legal_basis").map_err(sql_err)?,
        consent_id: row.try_get("consent_id").map_err(sql_err)?,
        data_region: row.try_get("data_region").map_err(sql_err)?,
        retention_until: row.try_get("retention_until").map_err(sql_err)?,
        contains_pii: row.try_get("contains_pii").map_err(sql_err)?,
        pii_redacted: row.try_get("pii_redacted").map_err(sql_err)?,
    })
}

/* ============================= TRAIT IMPL ============================= */

const INSERT_RECORD: &str = "\
INSERT INTO action_executions (
    started_at, correlation_id, operation_id, parent_operation_id, service_id,
    action_type, object_type, completed_at, duration_ms, action_status,
    error_message, error_type, request_url, response_url, logs_url,
    request_size_bytes, response_size_bytes, logs_size_bytes, metadata, tags,
    otel_trace_id, otel_span_id, data_subject_id, legal_basis, consent_id,
    data_region, retention_until, contains_pii, pii_redacted
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
) ON CONFLICT (started_at, correlation_id, operation_id) DO NOTHING";

#[async_trait]
impl TraceStore for PostgresTraceStore {
    async fn insert_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        for r in records {
            sqlx::query(INSERT_RECORD)
                .bind(r.started_at)
                .bind(&r.correlation_id)
                .bind(&r.operation_id)
                .bind(&r.parent_operation_id)
                .bind(&r.service_id)
                .bind(&r.action_type)
                .bind(&r.object_type)
                .bind(r.completed_at)
                .bind(r.duration_ms)
                .bind(r.action_status.as_str())
                .bind(&r.error_message)
                .bind(&r.error_type)
                .bind(&r.request_url)
                .bind(&r.response_url)
                .bind(&r.logs_url)
                .bind(r.request_size_bytes)
                .bind(r.response_size_bytes)
                .bind(r.logs_size_bytes)
                .bind(Json(&r.metadata))
                .bind(Json(&r.tags))
                .bind(&r.otel_trace_id)
                .bind(&r.otel_span_id)
                .bind(&r.data_subject_id)
                .bind(&r.legal_basis)
                .bind(&r.consent_id)
                .bind(&r.data_region)
                .bind(r.retention_until)
                .bind(r.contains_pii)
                .bind(r.pii_redacted)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }
        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }

    async fn insert_detections(&self, detections: &[PiiDetection]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        for d in detections {
            sqlx::query(
                "INSERT INTO pii_detections (
                    correlation_id, operation_id, location, field_path, pii_type,
                    pattern_matched, confidence, redacted, token
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&d.correlation_id)
            .bind(&d.operation_id)
            .bind(d.location.as_str())
            .bind(&d.field_path)
            .bind(d.pii_type.as_str())
            .bind(&d.pattern_matched)
            .bind(d.confidence)
            .bind(d.redacted)
            .bind(&d.token)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        }
        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }

    async fn insert_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO trace_access_audit (
                accessed_at, user_id, access_type, resource_type, correlation_id,
                operation_id, data_subject_id, purpose, legal_basis, results_count,
                query_parameters
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.accessed_at)
        .bind(&event.user_id)
        .bind(event.access_type.as_str())
        .bind(&event.resource_type)
        .bind(&event.correlation_id)
        .bind(&event.operation_id)
        .bind(&event.data_subject_id)
        .bind(&event.purpose)
        .bind(&event.legal_basis)
        .bind(event.results_count)
        .bind(event.query_parameters.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn records_by_subject(
        &self,
        data_subject_id: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        self.select_records("data_subject_id = $1", data_subject_id).await
    }

    async fn records_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        self.select_records("correlation_id = $1", correlation_id).await
    }

    async fn delete_by_subject(&self, data_subject_id: &str) -> Result<(u64, u64), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let detections = sqlx::query(
            "DELETE FROM pii_detections WHERE (correlation_id, operation_id) IN (
                SELECT correlation_id, operation_id FROM action_executions
                WHERE data_subject_id = $1
            )",
        )
        .bind(data_subject_id)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?
        .rows_affected();
        let records = sqlx::query("DELETE FROM action_executions WHERE data_subject_id = $1")
            .bind(data_subject_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?
            .rows_affected();
        tx.commit().await.map_err(sql_err)?;
        Ok((records, detections))
    }

    async fn delete_by_correlation(&self, correlation_id: &str) -> Result<(u64, u64), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let detections = sqlx::query("DELETE FROM pii_detections WHERE correlation_id = $1")
            .bind(correlation_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?
            .rows_affected();
        let records = sqlx::query("DELETE FROM action_executions WHERE correlation_id = $1")
            .bind(correlation_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?
            .rows_affected();
        tx.commit().await.map_err(sql_err)?;
        Ok((records, detections))
    }

    async fn pseudonymize_subject(
        &self,
        data_subject_id: &str,
        pseudonym: &str,
    ) -> Result<u64, StoreError> {
        let touched = sqlx::query(
            "UPDATE action_executions SET
                data_subject_id = $2,
                metadata = (metadata - 'name' - 'email' - 'phone' - 'address')
                    || CASE WHEN metadata ? 'client_ip'
                         THEN '{\"client_ip\": null}'::jsonb ELSE '{}'::jsonb END
                    || CASE WHEN metadata ? 'user_agent'
                         THEN '{\"user_agent\": \"[REDACTED]\"}'::jsonb ELSE '{}'::jsonb END
             WHERE data_subject_id = $1",
        )
        .bind(data_subject_id)
        .bind(pseudonym)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?
        .rows_affected();
        Ok(touched)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            "DELETE FROM action_executions
             WHERE retention_until IS NOT NULL AND retention_until < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?
        .rows_affected();
        Ok(deleted)
    }
}
