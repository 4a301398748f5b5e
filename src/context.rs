use serde::{Deserialize, Serialize};
use uuid::Uuid;

/* ============================= HEADERS ============================= */

/// Shared by all actions of one end-to-end workflow; propagated unchanged.
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Set by callers to the operation id of the calling action.
pub const PARENT_OPERATION_HEADER: &str = "X-Parent-Operation-ID";

/// Echoed on every response so callers can link to the action just recorded.
pub const OPERATION_HEADER: &str = "X-Operation-ID";

/* ============================= ID MINTING ============================= */

/// Mint a time-sortable 128-bit identifier rendered as 32 hex characters.
///
/// UUIDv7 embeds a millisecond timestamp in the high bits, so records keyed
/// by these ids cluster naturally in time-partitioned storage.
pub fn mint_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/* ============================= REQUEST CONTEXT ============================= */

/// Per-request tracing context threaded through the handler.
///
/// Built once on request entry and never mutated; outbound calls derive a
/// child context instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub correlation_id: String,
    pub operation_id: String,
    pub parent_operation_id: Option<String>,
    pub service_id: String,
}

impl RequestContext {
    /// Context for a request that starts a new workflow.
    pub fn root(service_id: &str) -> Self {
        Self {
            correlation_id: mint_id(),
            operation_id: mint_id(),
            parent_operation_id: None,
            service_id: service_id.to_string(),
        }
    }

    /// Context from inbound headers. A missing correlation header mints a new
    /// workflow; the operation id is always fresh.
    pub fn from_headers(
        service_id: &str,
        correlation: Option<&str>,
        parent_operation: Option<&str>,
    ) -> Self {
        Self {
            correlation_id: correlation
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or_else(mint_id),
            operation_id: mint_id(),
            parent_operation_id: parent_operation
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            service_id: service_id.to_string(),
        }
    }

    /// Headers to attach to an outbound call made from this request: the
    /// correlation id travels unchanged, the current operation becomes the
    /// callee's parent.
    pub fn propagation_headers(&self) -> [(&'static str, String); 2] {
        [
            (CORRELATION_HEADER, self.correlation_id.clone()),
            (PARENT_OPERATION_HEADER, self.operation_id.clone()),
        ]
    }

    /// Apply the propagation headers to an outbound reqwest builder.
    pub fn propagate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        for (name, value) in self.propagation_headers() {
            builder = builder.header(name, value);
        }
        builder
    }
}

/* ============================= OTEL LINKAGE ============================= */

/// Parse a W3C `traceparent` header into (trace_id, span_id) hex strings.
///
/// Returns `None` unless the header has the `00-{32hex}-{16hex}-{flags}`
/// shape; the ids are carried on the record for cross-linking only.
pub fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    parts.next()?;

    if version.len() != 2 || trace_id.len() != 32 || span_id.len() != 16 {
        return None;
    }
    if !trace_id.chars().all(|c| c.is_ascii_hexdigit())
        || !span_id.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }
    Some((trace_id.to_string(), span_id.to_string()))
}
