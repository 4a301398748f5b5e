use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::metrics::{ACCESS_AUDIT_TOTAL, ERASURE_OPERATIONS_TOTAL};
use crate::record::ActionRecord;
use crate::store::{StoreError, TraceStore};

/* ============================= AUDIT MODEL ============================= */

/// The kind of access a principal performed against trace data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Query,
    View,
    Export,
    Delete,
    Pseudonymize,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Query => "query",
            AccessType::View => "view",
            AccessType::Export => "export",
            AccessType::Delete => "delete",
            AccessType::Pseudonymize => "pseudonymize",
        }
    }
}

/// One row of the access audit trail. Field order is the canonical
/// serialization; there is no alternate rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub accessed_at: DateTime<Utc>,
    pub user_id: String,
    pub access_type: AccessType,
    pub resource_type: String,
    pub correlation_id: Option<String>,
    pub operation_id: Option<String>,
    pub data_subject_id: Option<String>,
    pub purpose: String,
    pub legal_basis: String,
    pub results_count: i64,
    pub query_parameters: Option<Value>,
}

/// Proof that `log_trace_access` ran for the current operation. Data paths
/// demand one; constructing it any other way is not possible outside this
/// module.
#[derive(Debug)]
pub struct AccessGrant {
    access_type: AccessType,
    logged: bool,
}

impl AccessGrant {
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }
}

/* ============================= OUTCOMES ============================= */

/// What an erasure removed, plus the object-store URLs the caller must
/// delete asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub struct ErasureOutcome {
    pub records_deleted: u64,
    pub detections_deleted: u64,
    pub payload_urls: Vec<String>,
}

/// Selector for erasure: by data subject or by workflow.
#[derive(Debug, Clone, Copy)]
pub enum EraseSelector<'a> {
    Subject(&'a str),
    Correlation(&'a str),
}

/* ============================= SERVICE ============================= */

/// GDPR operations over the trace store: erasure (Art. 17), pseudonymization,
/// export (Art. 20), the retention sweep, and the audit trail every
/// principal-initiated access must pass through first.
pub struct GdprService {
    store: Arc<dyn TraceStore>,
    salt: String,
    retention_max_days: i64,
}

impl GdprService {
    pub fn new(store: Arc<dyn TraceStore>, salt: &str, retention_max_days: i64) -> Self {
        Self { store, salt: salt.to_string(), retention_max_days }
    }

    pub fn retention_max_days(&self) -> i64 {
        self.retention_max_days
    }

    /// Stable pseudonym for a data subject.
    pub fn pseudonym(&self, data_subject_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data_subject_id.as_bytes());
        hasher.update(self.salt.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("PSEUDONYMIZED-{}", &hex[..16])
    }

    /// Record an access in the audit trail. Every read or mutation performed
    /// on behalf of a principal calls this before touching data.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_trace_access(
        &self,
        user_id: &str,
        access_type: AccessType,
        resource_type: &str,
        correlation_id: Option<&str>,
        data_subject_id: Option<&str>,
        purpose: &str,
        legal_basis: &str,
        results_count: i64,
        query_parameters: Option<Value>,
    ) -> Result<AccessGrant, StoreError> {
        let event = AuditEvent {
            accessed_at: Utc::now(),
            user_id: user_id.to_string(),
            access_type,
            resource_type: resource_type.to_string(),
            correlation_id: correlation_id.map(str::to_string),
            operation_id: None,
            data_subject_id: data_subject_id.map(str::to_string),
            purpose: purpose.to_string(),
            legal_basis: legal_basis.to_string(),
            results_count,
            query_parameters,
        };
        self.store.insert_audit(&event).await?;
        ACCESS_AUDIT_TOTAL.with_label_values(&[access_type.as_str()]).inc();
        info!(
            user = %user_id,
            access_type = access_type.as_str(),
            resource = %resource_type,
            "trace_access_audited"
        );
        Ok(AccessGrant { access_type, logged: true })
    }

    fn require_grant(grant: &AccessGrant) {
        // An unlogged grant cannot be constructed; the assert documents the
        // contract and trips in debug builds if that ever changes.
        debug_assert!(grant.logged, "trace data access without audit logging");
    }

    /// Erase every trace linked to the selector (Art. 17).
    ///
    /// Audits first, then deletes rows, then hands back the payload URLs for
    /// asynchronous object deletion. An unknown subject erases zero rows and
    /// is not an error; repeated calls keep returning zero and keep emitting
    /// one audit row each.
    pub async fn erase(
        &self,
        user_id: &str,
        selector: EraseSelector<'_>,
        purpose: &str,
        legal_basis: &str,
    ) -> Result<ErasureOutcome, StoreError> {
        let (correlation, subject, records) = match selector {
            EraseSelector::Subject(id) => {
                (None, Some(id), self.store.records_by_subject(id).await?)
            }
            EraseSelector::Correlation(id) => {
                (Some(id), None, self.store.records_by_correlation(id).await?)
            }
        };

        let payload_urls: Vec<String> =
            records.iter().flat_map(|r| r.live_payload_urls()).collect();

        let grant = self
            .log_trace_access(
                user_id,
                AccessType::Delete,
                "action_executions",
                correlation,
                subject,
                purpose,
                legal_basis,
                records.len() as i64,
                None,
            )
            .await?;
        Self::require_grant(&grant);

        let (records_deleted, detections_deleted) = match selector {
            EraseSelector::Subject(id) => self.store.delete_by_subject(id).await?,
            EraseSelector::Correlation(id) => self.store.delete_by_correlation(id).await?,
        };

        ERASURE_OPERATIONS_TOTAL.inc();
        info!(
            user = %user_id,
            records = records_deleted,
            detections = detections_deleted,
            objects = payload_urls.len(),
            "erasure_completed"
        );

        Ok(ErasureOutcome { records_deleted, detections_deleted, payload_urls })
    }

    /// Replace a subject id with a stable pseudonym and strip direct
    /// identifiers from record metadata. Audited. Returns records touched.
    pub async fn pseudonymize(
        &self,
        user_id: &str,
        data_subject_id: &str,
        purpose: &str,
        legal_basis: &str,
    ) -> Result<u64, StoreError> {
        let grant = self
            .log_trace_access(
                user_id,
                AccessType::Pseudonymize,
                "action_executions",
                None,
                Some(data_subject_id),
                purpose,
                legal_basis,
                0,
                None,
            )
            .await?;
        Self::require_grant(&grant);

        let pseudonym = self.pseudonym(data_subject_id);
        let touched = self.store.pseudonymize_subject(data_subject_id, &pseudonym).await?;
        info!(user = %user_id, records = touched, "pseudonymization_completed");
        Ok(touched)
    }

    /// Every record for a data subject, newest first (Art. 20). Audited.
    pub async fn export(
        &self,
        user_id: &str,
        data_subject_id: &str,
        purpose: &str,
        legal_basis: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let records = self.store.records_by_subject(data_subject_id).await?;
        let grant = self
            .log_trace_access(
                user_id,
                AccessType::Export,
                "action_executions",
                None,
                Some(data_subject_id),
                purpose,
                legal_basis,
                records.len() as i64,
                None,
            )
            .await?;
        Self::require_grant(&grant);
        Ok(records)
    }

    /// Delete every record whose retention deadline has passed. Idempotent;
    /// one audit event per sweep batch, attributed to the system principal.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = self.store.delete_expired(now).await?;
        let event = AuditEvent {
            accessed_at: Utc::now(),
            user_id: "retention-sweep".to_string(),
            access_type: AccessType::Delete,
            resource_type: "action_executions".to_string(),
            correlation_id: None,
            operation_id: None,
            data_subject_id: None,
            purpose: "retention enforcement".to_string(),
            legal_basis: "retention policy".to_string(),
            results_count: deleted as i64,
            query_parameters: None,
        };
        self.store.insert_audit(&event).await?;
        ACCESS_AUDIT_TOTAL.with_label_values(&[AccessType::Delete.as_str()]).inc();
        info!(deleted, "retention_sweep_completed");
        Ok(deleted)
    }
}
