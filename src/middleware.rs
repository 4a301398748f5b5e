use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{route_key, TracerConfig};
use crate::context::{
    parse_traceparent, RequestContext, CORRELATION_HEADER, OPERATION_HEADER,
    PARENT_OPERATION_HEADER,
};
use crate::exporter::{flush_batch, AsyncExporter, ExportOptions, ExportRecord};
use crate::extractor::extract_metadata;
use crate::metrics::{ACTIONS_TOTAL, ACTION_DURATION_SECONDS, ACTION_ERRORS_TOTAL};
use crate::pii::{PiiLocation, PiiScanner};
use crate::record::{ActionRecord, ActionStatus};
use crate::sampler::Sampler;
use crate::store::{ObjectStore, TraceStore};

/* ============================= LIMITS ============================= */

/// Payloads above this size are traced without body capture.
const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Optional subject header set by authenticating proxies.
const DATA_SUBJECT_HEADER: &str = "X-Data-Subject-ID";

const DEFAULT_ACTION_TYPE: &str = "Action";
const DEFAULT_OBJECT_TYPE: &str = "Thing";

/* ============================= TRACER ============================= */

/// Binds id propagation, extraction, PII guarding, sampling, and export
/// behind one axum middleware. Construction wires the worker pool; dropping
/// without `shutdown` abandons queued records.
pub struct Tracer {
    config: TracerConfig,
    sampler: Sampler,
    scanner: PiiScanner,
    exporter: Mutex<Option<AsyncExporter>>,
    trace_store: Arc<dyn TraceStore>,
    object_store: Arc<dyn ObjectStore>,
    options: ExportOptions,
}

impl Tracer {
    pub fn new(
        config: TracerConfig,
        trace_store: Arc<dyn TraceStore>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        let options = ExportOptions {
            bucket: config.object_bucket.clone(),
            prefix: config.object_prefix.clone().unwrap_or_default(),
            store_payload: config.store_payload,
        };

        let exporter = if config.enabled && config.async_export {
            Some(AsyncExporter::start(
                config.async_config.clone(),
                options.clone(),
                trace_store.clone(),
                object_store.clone(),
            ))
        } else {
            None
        };

        Arc::new(Self {
            sampler: Sampler::new(config.sampling_enabled, config.sampling_config.clone()),
            scanner: PiiScanner::new(config.redact_pii, &config.pii_salt),
            exporter: Mutex::new(exporter),
            trace_store,
            object_store,
            options,
            config,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }

    /// Stop the exporter, draining up to `timeout`. Returns records unsent.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let exporter = self.exporter.lock().expect("exporter lock").take();
        match exporter {
            Some(exporter) => exporter.close(timeout).await,
            None => 0,
        }
    }

    fn route_action(&self, method: &str, path: &str) -> (String, String) {
        match self.config.route_actions.get(&route_key(method, path)) {
            Some(route) => (route.action_type.clone(), route.object_type.clone()),
            None => (DEFAULT_ACTION_TYPE.to_string(), DEFAULT_OBJECT_TYPE.to_string()),
        }
    }
}

/* ============================= MIDDLEWARE ============================= */

/// The HTTP entry point: wrap a router with
/// `axum::middleware::from_fn_with_state(tracer, middleware::trace)`.
pub async fn trace(
    State(tracer): State<Arc<Tracer>>,
    req: Request,
    next: Next,
) -> Response {
    if !tracer.config.enabled {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let ctx = RequestContext::from_headers(
        &tracer.config.service_id,
        header_str(req.headers(), CORRELATION_HEADER),
        header_str(req.headers(), PARENT_OPERATION_HEADER),
    );
    let otel = header_str(req.headers(), "traceparent").and_then(parse_traceparent);
    let data_subject = header_str(req.headers(), DATA_SUBJECT_HEADER).map(str::to_string);

    let started_at = Utc::now();

    // Buffer the request body so both the handler and the tracer can read it.
    let (parts, body) = req.into_parts();
    let request_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "request_body_read_failed");
            Default::default()
        }
    };
    let mut req = Request::from_parts(parts, Body::from(request_bytes.clone()));
    req.extensions_mut().insert(ctx.clone());

    let response = next.run(req).await;
    let completed_at = Utc::now();

    let status_code = response.status();
    let (parts, body) = response.into_parts();
    let response_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response_body_read_failed");
            Default::default()
        }
    };
    let mut response = Response::from_parts(parts, Body::from(response_bytes.clone()));

    set_header(response.headers_mut(), CORRELATION_HEADER, &ctx.correlation_id);
    set_header(response.headers_mut(), OPERATION_HEADER, &ctx.operation_id);

    // Everything below is bookkeeping; it must never change the response.
    let status = if status_code.is_server_error() {
        ActionStatus::Failed
    } else {
        ActionStatus::Completed
    };

    let request_json: Option<Value> = serde_json::from_slice(&request_bytes).ok();
    let response_json: Option<Value> = serde_json::from_slice(&response_bytes).ok();

    let (action_type, object_type) = match action_types_from_body(request_json.as_ref()) {
        Some(types) => types,
        None => tracer.route_action(&method, &path),
    };

    let mut record = ActionRecord::start(&ctx, &action_type, &object_type, started_at);
    record.complete(
        completed_at,
        status,
        if status == ActionStatus::Failed {
            Some(format!("handler returned {status_code}"))
        } else {
            None
        },
        if status == ActionStatus::Failed { Some("http_5xx".to_string()) } else { None },
    );

    if let Some((trace_id, span_id)) = otel {
        record.otel_trace_id = Some(trace_id);
        record.otel_span_id = Some(span_id);
    }
    record.data_subject_id = data_subject;
    record.legal_basis = tracer.config.default_legal_basis.clone();
    record.data_region = tracer.config.data_region.clone();
    record.clamp_retention(tracer.config.retention_days);

    record.metadata = extract_metadata(
        &action_type,
        &object_type,
        request_json.as_ref(),
        response_json.as_ref(),
    );

    // PII pass: bodies as text, metadata as a JSON tree.
    let mut detections = Vec::new();

    let request_text = capture_text(&request_bytes);
    let request_payload = request_text.map(|text| {
        let outcome = tracer.scanner.scan_text(
            &text,
            PiiLocation::Request,
            "body",
            &ctx.correlation_id,
            &ctx.operation_id,
        );
        detections.extend(outcome.detections);
        outcome.text.into_bytes()
    });

    let response_text = capture_text(&response_bytes);
    let response_payload = response_text.map(|text| {
        let outcome = tracer.scanner.scan_text(
            &text,
            PiiLocation::Response,
            "body",
            &ctx.correlation_id,
            &ctx.operation_id,
        );
        detections.extend(outcome.detections);
        outcome.text.into_bytes()
    });

    let mut metadata_value = Value::Object(record.metadata.clone());
    let metadata_detections = tracer.scanner.scan_json(
        &mut metadata_value,
        PiiLocation::Metadata,
        &ctx.correlation_id,
        &ctx.operation_id,
    );
    if !metadata_detections.is_empty() {
        if let Value::Object(map) = metadata_value {
            record.metadata = map;
        }
        detections.extend(metadata_detections);
    }

    record.contains_pii = !detections.is_empty();
    record.pii_redacted = record.contains_pii && tracer.scanner.redaction_enabled();

    ACTIONS_TOTAL
        .with_label_values(&[&tracer.config.service_id, &action_type, status.as_str()])
        .inc();
    ACTION_DURATION_SECONDS.observe(record.duration_ms as f64 / 1000.0);
    if status == ActionStatus::Failed {
        ACTION_ERRORS_TOTAL
            .with_label_values(&[&tracer.config.service_id, "http_5xx"])
            .inc();
    }

    info!(
        correlation_id = %record.correlation_id,
        operation_id = %record.operation_id,
        service_id = %record.service_id,
        action_type = %record.action_type,
        object_type = %record.object_type,
        status = record.action_status.as_str(),
        duration_ms = record.duration_ms,
        "action_recorded"
    );

    if record.contains_pii && !record.pii_redacted {
        // Detection-only deployments keep unredacted PII out of the pipeline.
        warn!(
            correlation_id = %record.correlation_id,
            operation_id = %record.operation_id,
            "pii_detected_export_blocked"
        );
        return response;
    }

    let decision = tracer.sampler.decide(&record);
    if !decision.keep {
        return response;
    }

    let mut export = ExportRecord::new(record);
    export.request_body = request_payload;
    export.response_body = response_payload;
    export.detections = detections;

    let sync_export = {
        let exporter = tracer.exporter.lock().expect("exporter lock");
        match exporter.as_ref() {
            Some(exporter) => {
                if !exporter.enqueue(export) {
                    warn!(correlation_id = %ctx.correlation_id, "export_enqueue_dropped");
                }
                None
            }
            None => Some(export),
        }
    };
    if let Some(export) = sync_export {
        // Synchronous export path: flush inline on the request task.
        let mut batch = vec![export];
        flush_batch(
            &mut batch,
            tracer.trace_store.as_ref(),
            tracer.object_store.as_ref(),
            &tracer.options,
        )
        .await;
    }

    response
}

/* ============================= HELPERS ============================= */

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Body bytes as UTF-8 text, bounded by the capture limit.
fn capture_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || bytes.len() > MAX_PAYLOAD_BYTES {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

/// `@type` and `object.@type` from a typed JSON-LD request body.
fn action_types_from_body(body: Option<&Value>) -> Option<(String, String)> {
    let body = body?;
    let action = body.get("@type")?.as_str()?;
    let object = body
        .get("object")
        .and_then(|o| o.get("@type"))
        .and_then(|t| t.as_str())
        .unwrap_or(DEFAULT_OBJECT_TYPE);
    Some((action.to_string(), object.to_string()))
}
