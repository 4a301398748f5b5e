use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::metrics::SAMPLING_DECISIONS_TOTAL;
use crate::record::{ActionRecord, ActionStatus};

/* ============================= CONFIG ============================= */

/// Sampling policy applied to every completed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
    /// Fraction of workflows kept by the hash path, in [0, 1].
    pub base_rate: f64,
    /// Keep every failed record regardless of rate.
    pub always_sample_errors: bool,
    /// Keep every record at or above `slow_threshold_ms`.
    pub always_sample_slow: bool,
    pub slow_threshold_ms: i64,
    /// Hash the correlation id so a workflow is kept or dropped as a whole.
    /// When false the operation id is hashed instead, giving an independent
    /// per-record draw at the same rate.
    pub deterministic: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            base_rate: 0.1,
            always_sample_errors: true,
            always_sample_slow: true,
            slow_threshold_ms: 5_000,
            deterministic: true,
        }
    }
}

/* ============================= DECISION ============================= */

/// Why a record was kept or dropped. Exposed as a metrics label; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleReason {
    AlwaysError,
    AlwaysSlow,
    DeterministicHash,
    DisabledKept,
    RateDropped,
}

impl SampleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleReason::AlwaysError => "always-error",
            SampleReason::AlwaysSlow => "always-slow",
            SampleReason::DeterministicHash => "deterministic-hash",
            SampleReason::DisabledKept => "disabled-kept",
            SampleReason::RateDropped => "rate-dropped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingDecision {
    pub keep: bool,
    pub reason: SampleReason,
}

/* ============================= SAMPLER ============================= */

pub struct Sampler {
    enabled: bool,
    config: SamplingConfig,
}

/// Map a correlation (or operation) id onto [0, 1).
fn hash_fraction(id: &str) -> f64 {
    xxh64(id.as_bytes(), 0) as f64 / (u64::MAX as f64 + 1.0)
}

impl Sampler {
    pub fn new(enabled: bool, config: SamplingConfig) -> Self {
        Self { enabled, config }
    }

    /// Decide keep/drop for a completed record.
    ///
    /// Order: disabled, always-error, always-slow, hash, drop. Records sharing
    /// a correlation id always agree on the hash-path outcome.
    pub fn decide(&self, record: &ActionRecord) -> SamplingDecision {
        let decision = self.decide_inner(record);
        SAMPLING_DECISIONS_TOTAL
            .with_label_values(&[decision.reason.as_str()])
            .inc();
        decision
    }

    fn decide_inner(&self, record: &ActionRecord) -> SamplingDecision {
        if !self.enabled {
            return SamplingDecision { keep: true, reason: SampleReason::DisabledKept };
        }

        if self.config.always_sample_errors && record.action_status == ActionStatus::Failed {
            return SamplingDecision { keep: true, reason: SampleReason::AlwaysError };
        }

        if self.config.always_sample_slow && record.duration_ms >= self.config.slow_threshold_ms {
            return SamplingDecision { keep: true, reason: SampleReason::AlwaysSlow };
        }

        let id = if self.config.deterministic {
            &record.correlation_id
        } else {
            &record.operation_id
        };
        if hash_fraction(id) < self.config.base_rate {
            return SamplingDecision { keep: true, reason: SampleReason::DeterministicHash };
        }

        SamplingDecision { keep: false, reason: SampleReason::RateDropped }
    }
}
