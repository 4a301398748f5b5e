use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::metrics::PII_DETECTIONS_TOTAL;

/* ============================= TYPES ============================= */

/// The closed set of PII categories the guard detects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PiiType {
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
}

impl PiiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiType::Email => "email",
            PiiType::Phone => "phone",
            PiiType::Ssn => "ssn",
            PiiType::CreditCard => "credit-card",
            PiiType::IpAddress => "ip-address",
        }
    }
}

/// Where in the record a match was found.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PiiLocation {
    Request,
    Response,
    Metadata,
}

impl PiiLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiLocation::Request => "request",
            PiiLocation::Response => "response",
            PiiLocation::Metadata => "metadata",
        }
    }
}

/// One PII match, persisted alongside the action record it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PiiDetection {
    pub correlation_id: String,
    pub operation_id: String,
    pub location: PiiLocation,
    pub field_path: String,
    pub pii_type: PiiType,
    pub pattern_matched: String,
    pub confidence: f64,
    pub redacted: bool,
    pub token: Option<String>,
}

/* ============================= DETECTORS ============================= */

struct Detector {
    pii_type: PiiType,
    pattern: Regex,
    confidence: f64,
}

/// Detector order matters: more specific patterns run first so their
/// replacements remove text the looser patterns (phone) would also match.
static DETECTORS: LazyLock<Vec<Detector>> = LazyLock::new(|| {
    let detector = |pii_type, pattern: &str, confidence| Detector {
        pii_type,
        pattern: Regex::new(pattern).expect("detector pattern is valid"),
        confidence,
    };
    vec![
        detector(
            PiiType::Email,
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            0.95,
        ),
        detector(PiiType::Ssn, r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b", 0.9),
        detector(
            PiiType::CreditCard,
            r"\b(?:[0-9]{4}[ -]){3}[0-9]{4}\b|\b[0-9]{16}\b",
            0.8,
        ),
        detector(
            PiiType::IpAddress,
            r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b",
            0.7,
        ),
        detector(
            PiiType::Phone,
            r"\+[0-9][0-9 ().-]{7,16}[0-9]|\b[0-9]{3}[-.][0-9]{3}[-.][0-9]{4}\b",
            0.5,
        ),
    ]
});

/* ============================= SCANNER ============================= */

/// Result of scanning one text: the (possibly rewritten) text plus every match.
pub struct ScanOutcome {
    pub text: String,
    pub detections: Vec<PiiDetection>,
}

/// Detects PII and, when `redact` is on, rewrites matches to
/// `[REDACTED:type:token]` where the token is a salted hash of the original
/// value. With redaction off, matches are recorded but left intact and the
/// caller flags the record `contains_pii` instead.
pub struct PiiScanner {
    redact: bool,
    salt: String,
}

impl PiiScanner {
    pub fn new(redact: bool, salt: &str) -> Self {
        Self { redact, salt: salt.to_string() }
    }

    pub fn redaction_enabled(&self) -> bool {
        self.redact
    }

    /// Opaque, stable token for a redacted value.
    pub fn token(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hasher.update(self.salt.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }

    /// Run every detector over `text`, recording matches against the given
    /// record coordinates.
    pub fn scan_text(
        &self,
        text: &str,
        location: PiiLocation,
        field_path: &str,
        correlation_id: &str,
        operation_id: &str,
    ) -> ScanOutcome {
        let mut current = text.to_string();
        let mut detections = Vec::new();

        for detector in DETECTORS.iter() {
            let mut matched: Vec<String> = Vec::new();
            let rewritten = detector.pattern.replace_all(&current, |caps: &regex::Captures| {
                let value = caps[0].to_string();
                let replacement = if self.redact {
                    format!("[REDACTED:{}:{}]", detector.pii_type.as_str(), self.token(&value))
                } else {
                    value.clone()
                };
                matched.push(value);
                replacement
            });
            if !matched.is_empty() {
                current = rewritten.into_owned();
            }

            for value in matched {
                PII_DETECTIONS_TOTAL
                    .with_label_values(&[detector.pii_type.as_str()])
                    .inc();
                detections.push(PiiDetection {
                    correlation_id: correlation_id.to_string(),
                    operation_id: operation_id.to_string(),
                    location,
                    field_path: field_path.to_string(),
                    pii_type: detector.pii_type,
                    pattern_matched: detector.pattern.as_str().to_string(),
                    confidence: detector.confidence,
                    redacted: self.redact,
                    token: if self.redact { Some(self.token(&value)) } else { None },
                });
            }
        }

        ScanOutcome { text: current, detections }
    }

    /// Walk a JSON tree, scanning every string leaf. Leaves are rewritten in
    /// place when redaction is enabled; `field_path` tracks the dotted path.
    pub fn scan_json(
        &self,
        value: &mut Value,
        location: PiiLocation,
        correlation_id: &str,
        operation_id: &str,
    ) -> Vec<PiiDetection> {
        let mut detections = Vec::new();
        self.walk(value, location, "", correlation_id, operation_id, &mut detections);
        detections
    }

    fn walk(
        &self,
        value: &mut Value,
        location: PiiLocation,
        path: &str,
        correlation_id: &str,
        operation_id: &str,
        detections: &mut Vec<PiiDetection>,
    ) {
        match value {
            Value::String(s) => {
                let outcome = self.scan_text(s, location, path, correlation_id, operation_id);
                if !outcome.detections.is_empty() {
                    if self.redact {
                        *s = outcome.text;
                    }
                    detections.extend(outcome.detections);
                }
            }
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.walk(child, location, &child_path, correlation_id, operation_id, detections);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    let child_path = format!("{path}[{i}]");
                    self.walk(child, location, &child_path, correlation_id, operation_id, detections);
                }
            }
            _ => {}
        }
    }
}
