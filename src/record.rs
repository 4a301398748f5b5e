use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::RequestContext;

/* ============================= STATUS ============================= */

/// Outcome of a traced action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionStatus {
    Active,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Active => "Active",
            ActionStatus::Completed => "Completed",
            ActionStatus::Failed => "Failed",
        }
    }
}

/* ============================= MARKERS ============================= */

/// Prefix shared by every redaction marker written into payload URL columns.
pub const REDACTED_MARKER_PREFIX: &str = "[REDACTED";

/// Marker written over payload URLs during erasure and pseudonymization.
pub const REDACTED_URL: &str = "[REDACTED]";

pub fn is_redacted_marker(value: &str) -> bool {
    value.starts_with(REDACTED_MARKER_PREFIX)
}

/* ============================= RECORD ============================= */

/// One semantically-typed action captured by the tracer.
///
/// Keyed by (started_at, correlation_id, operation_id) so rows partition
/// naturally by day. Immutable once completed, except for GDPR erasure and
/// pseudonymization which zero specific fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub correlation_id: String,
    pub operation_id: String,
    pub parent_operation_id: Option<String>,
    pub service_id: String,

    pub action_type: String,
    pub object_type: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub action_status: ActionStatus,
    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub request_url: Option<String>,
    pub response_url: Option<String>,
    pub logs_url: Option<String>,
    pub request_size_bytes: i64,
    pub response_size_bytes: i64,
    pub logs_size_bytes: i64,

    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,

    pub otel_trace_id: Option<String>,
    pub otel_span_id: Option<String>,

    pub data_subject_id: Option<String>,
    pub legal_basis: Option<String>,
    pub consent_id: Option<String>,
    pub data_region: Option<String>,
    pub retention_until: Option<DateTime<Utc>>,
    pub contains_pii: bool,
    pub pii_redacted: bool,
}

impl ActionRecord {
    /// A fresh record in `Active` state, as created on request entry.
    pub fn start(
        ctx: &RequestContext,
        action_type: &str,
        object_type: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: ctx.correlation_id.clone(),
            operation_id: ctx.operation_id.clone(),
            parent_operation_id: ctx.parent_operation_id.clone(),
            service_id: ctx.service_id.clone(),
            action_type: action_type.to_string(),
            object_type: object_type.to_string(),
            started_at,
            completed_at: None,
            duration_ms: 0,
            action_status: ActionStatus::Active,
            error_message: None,
            error_type: None,
            request_url: None,
            response_url: None,
            logs_url: None,
            request_size_bytes: 0,
            response_size_bytes: 0,
            logs_size_bytes: 0,
            metadata: Map::new(),
            tags: BTreeSet::new(),
            otel_trace_id: None,
            otel_span_id: None,
            data_subject_id: None,
            legal_basis: None,
            consent_id: None,
            data_region: None,
            retention_until: None,
            contains_pii: false,
            pii_redacted: false,
        }
    }

    /// Transition to a terminal status and derive `duration_ms`.
    pub fn complete(
        &mut self,
        completed_at: DateTime<Utc>,
        status: ActionStatus,
        error_message: Option<String>,
        error_type: Option<String>,
    ) {
        self.completed_at = Some(completed_at);
        self.duration_ms = (completed_at - self.started_at).num_milliseconds();
        self.action_status = status;
        self.error_message = error_message;
        self.error_type = error_type;
    }

    /// Cap `retention_until` at `started_at + max_days`. Retention deadlines
    /// are monotone: this only ever shortens, never extends.
    pub fn clamp_retention(&mut self, max_days: i64) {
        let ceiling = self.started_at + Duration::days(max_days);
        match self.retention_until {
            Some(until) if until > ceiling => self.retention_until = Some(ceiling),
            None => self.retention_until = Some(ceiling),
            _ => {}
        }
    }

    /// Overwrite all payload URL columns with the redaction marker.
    pub fn redact_payload_urls(&mut self) {
        for url in [&mut self.request_url, &mut self.response_url, &mut self.logs_url] {
            if url.is_some() {
                *url = Some(REDACTED_URL.to_string());
            }
        }
    }

    /// Payload URLs that reference live objects (not null, not redacted).
    pub fn live_payload_urls(&self) -> Vec<String> {
        [&self.request_url, &self.response_url, &self.logs_url]
            .into_iter()
            .flatten()
            .filter(|u| !is_redacted_marker(u))
            .cloned()
            .collect()
    }
}

/* ============================= PSEUDONYMIZATION ============================= */

/// Metadata keys stripped during pseudonymization.
const DIRECT_IDENTIFIER_KEYS: &[&str] = &["name", "email", "phone", "address"];

/// Remove direct identifiers from a metadata map in place: drops name/email/
/// phone/address, nulls the client IP, redacts the user agent.
pub fn pseudonymize_metadata(metadata: &mut Map<String, Value>) {
    for key in DIRECT_IDENTIFIER_KEYS {
        metadata.remove(*key);
    }
    if metadata.contains_key("client_ip") {
        metadata.insert("client_ip".to_string(), Value::Null);
    }
    if metadata.contains_key("user_agent") {
        metadata.insert("user_agent".to_string(), Value::String(REDACTED_URL.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> RequestContext {
        RequestContext {
            correlation_id: "wf-1".to_string(),
            operation_id: "op-1".to_string(),
            parent_operation_id: None,
            service_id: "svc".to_string(),
        }
    }

    // ── lifecycle ──

    #[test]
    fn test_start_is_active() {
        let r = ActionRecord::start(&test_ctx(), "CreateAction", "SoftwareApplication", Utc::now());
        assert_eq!(r.action_status, ActionStatus::Active);
        assert!(r.completed_at.is_none());
        assert_eq!(r.duration_ms, 0);
    }

    #[test]
    fn test_complete_derives_duration() {
        let started = Utc::now();
        let mut r = ActionRecord::start(&test_ctx(), "CreateAction", "Thing", started);
        r.complete(started + Duration::milliseconds(250), ActionStatus::Completed, None, None);
        assert_eq!(r.action_status, ActionStatus::Completed);
        assert_eq!(r.duration_ms, 250);
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn test_complete_failed_carries_error() {
        let started = Utc::now();
        let mut r = ActionRecord::start(&test_ctx(), "CreateAction", "Thing", started);
        r.complete(
            started + Duration::milliseconds(10),
            ActionStatus::Failed,
            Some("boom".to_string()),
            Some("internal".to_string()),
        );
        assert_eq!(r.action_status, ActionStatus::Failed);
        assert_eq!(r.error_message.as_deref(), Some("boom"));
        assert_eq!(r.error_type.as_deref(), Some("internal"));
    }

    // ── retention ──

    #[test]
    fn test_clamp_retention_fills_missing() {
        let mut r = ActionRecord::start(&test_ctx(), "a", "b", Utc::now());
        r.clamp_retention(90);
        assert_eq!(r.retention_until, Some(r.started_at + Duration::days(90)));
    }

    #[test]
    fn test_clamp_retention_shortens_excess() {
        let mut r = ActionRecord::start(&test_ctx(), "a", "b", Utc::now());
        r.retention_until = Some(r.started_at + Duration::days(400));
        r.clamp_retention(90);
        assert_eq!(r.retention_until, Some(r.started_at + Duration::days(90)));
    }

    #[test]
    fn test_clamp_retention_never_extends() {
        let mut r = ActionRecord::start(&test_ctx(), "a", "b", Utc::now());
        let short = r.started_at + Duration::days(7);
        r.retention_until = Some(short);
        r.clamp_retention(90);
        assert_eq!(r.retention_until, Some(short));
    }

    // ── payload urls ──

    #[test]
    fn test_redact_payload_urls() {
        let mut r = ActionRecord::start(&test_ctx(), "a", "b", Utc::now());
        r.request_url = Some("s3://bucket/wf-1/op-1/request.json".to_string());
        r.response_url = None;
        r.redact_payload_urls();
        assert_eq!(r.request_url.as_deref(), Some(REDACTED_URL));
        assert!(r.response_url.is_none(), "null URLs stay null");
    }

    #[test]
    fn test_live_payload_urls_skips_redacted_and_null() {
        let mut r = ActionRecord::start(&test_ctx(), "a", "b", Utc::now());
        r.request_url = Some("s3://b/k1".to_string());
        r.response_url = Some(REDACTED_URL.to_string());
        r.logs_url = None;
        assert_eq!(r.live_payload_urls(), vec!["s3://b/k1".to_string()]);
    }

    #[test]
    fn test_is_redacted_marker() {
        assert!(is_redacted_marker("[REDACTED]"));
        assert!(is_redacted_marker("[REDACTED:email:ab12]"));
        assert!(!is_redacted_marker("s3://bucket/key"));
    }

    // ── pseudonymization helper ──

    #[test]
    fn test_pseudonymize_metadata_strips_identifiers() {
        let mut m = Map::new();
        m.insert("name".to_string(), Value::String("Alex".to_string()));
        m.insert("email".to_string(), Value::String("a@example.com".to_string()));
        m.insert("client_ip".to_string(), Value::String("10.0.0.1".to_string()));
        m.insert("user_agent".to_string(), Value::String("curl/8".to_string()));
        m.insert("progress_percent".to_string(), Value::from(50));

        pseudonymize_metadata(&mut m);

        assert!(!m.contains_key("name"));
        assert!(!m.contains_key("email"));
        assert_eq!(m["client_ip"], Value::Null);
        assert_eq!(m["user_agent"], Value::String(REDACTED_URL.to_string()));
        assert_eq!(m["progress_percent"], Value::from(50), "non-identifying keys survive");
    }
}
