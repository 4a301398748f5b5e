use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::exporter::AsyncConfig;
use crate::sampler::SamplingConfig;

/* ============================= ROUTE TABLE ============================= */

/// Action typing for requests whose body carries no `@type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteAction {
    pub action_type: String,
    pub object_type: String,
}

/// Key for the route table: `"METHOD /path"`, e.g. `"POST /deployments"`.
pub fn route_key(method: &str, path: &str) -> String {
    format!("{} {}", method.to_uppercase(), path)
}

/* ============================= TRACER CONFIG ============================= */

/// Everything the tracer middleware needs, minus the injected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerConfig {
    pub service_id: String,
    pub enabled: bool,
    pub async_export: bool,
    #[serde(default)]
    pub async_config: AsyncConfig,
    pub sampling_enabled: bool,
    #[serde(default)]
    pub sampling_config: SamplingConfig,
    pub enable_metrics: bool,

    pub object_bucket: String,
    #[serde(default)]
    pub object_prefix: Option<String>,
    /// Upload request/response payloads alongside the metadata row.
    #[serde(default = "default_true")]
    pub store_payload: bool,

    /// Redact detected PII in place; false records detections only and flags
    /// the record instead.
    #[serde(default = "default_true")]
    pub redact_pii: bool,
    /// Salt for redaction tokens and pseudonyms.
    #[serde(default)]
    pub pii_salt: String,

    /// Baseline retention in days; per-record deadlines are clamped to this.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub default_legal_basis: Option<String>,
    #[serde(default)]
    pub data_region: Option<String>,

    /// `"METHOD /path"` → action/object types, consulted when the request
    /// body is not a typed JSON-LD action.
    #[serde(default)]
    pub route_actions: HashMap<String, RouteAction>,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    90
}

impl TracerConfig {
    pub fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            enabled: true,
            async_export: true,
            async_config: AsyncConfig::default(),
            sampling_enabled: true,
            sampling_config: SamplingConfig::default(),
            enable_metrics: true,
            object_bucket: "traces".to_string(),
            object_prefix: None,
            store_payload: true,
            redact_pii: true,
            pii_salt: String::new(),
            retention_days: default_retention_days(),
            default_legal_basis: None,
            data_region: None,
            route_actions: HashMap::new(),
        }
    }

    pub fn with_route(mut self, method: &str, path: &str, action: &str, object: &str) -> Self {
        self.route_actions.insert(
            route_key(method, path),
            RouteAction { action_type: action.to_string(), object_type: object.to_string() },
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TracerConfig::new("billing");
        assert_eq!(cfg.service_id, "billing");
        assert!(cfg.enabled);
        assert!(cfg.async_export);
        assert!(cfg.store_payload);
        assert!(cfg.redact_pii);
        assert_eq!(cfg.retention_days, 90);
        assert_eq!(cfg.async_config.queue_size, 10_000);
        assert_eq!(cfg.async_config.batch_size, 100);
        assert_eq!(cfg.async_config.workers, 4);
    }

    #[test]
    fn test_route_key_uppercases_method() {
        assert_eq!(route_key("post", "/deployments"), "POST /deployments");
    }

    #[test]
    fn test_with_route() {
        let cfg = TracerConfig::new("svc").with_route("POST", "/backups", "UploadAction", "Dataset");
        let action = &cfg.route_actions["POST /backups"];
        assert_eq!(action.action_type, "UploadAction");
        assert_eq!(action.object_type, "Dataset");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: TracerConfig = serde_json::from_str(
            r#"{
                "serviceId": "svc",
                "enabled": true,
                "asyncExport": true,
                "samplingEnabled": false,
                "enableMetrics": true,
                "objectBucket": "traces"
            }"#,
        )
        .expect("minimal config parses");
        assert_eq!(cfg.async_config.workers, 4);
        assert!(cfg.sampling_config.deterministic);
    }
}
