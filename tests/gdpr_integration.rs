mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::make_record;
use tracedock::gdpr::{AccessType, EraseSelector, GdprService};
use tracedock::pii::{PiiDetection, PiiLocation, PiiType};
use tracedock::record::ActionStatus;
use tracedock::store::{MemoryTraceStore, TraceStore};

// ══════════════════════════════════════════════════════════════════
// GDPR integration tests
//
// Erasure, pseudonymization, export, and the retention sweep against
// the in-memory trace store, with the audit trail checked throughout.
// ══════════════════════════════════════════════════════════════════

fn service(store: Arc<MemoryTraceStore>) -> GdprService {
    GdprService::new(store, "integration-salt", 90)
}

fn detection_for(correlation: &str, operation: &str) -> PiiDetection {
    PiiDetection {
        correlation_id: correlation.to_string(),
        operation_id: operation.to_string(),
        location: PiiLocation::Request,
        field_path: "body".to_string(),
        pii_type: PiiType::Email,
        pattern_matched: String::new(),
        confidence: 0.95,
        redacted: true,
        token: Some("tok".to_string()),
    }
}

// ── scenario: erase a subject with stored payloads ──

#[tokio::test]
async fn test_erasure_full_scenario() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());

    let mut records = Vec::new();
    let mut detections = Vec::new();
    for i in 0..3 {
        let mut r = make_record(
            &format!("wf-{i}"),
            &format!("op-{i}"),
            ActionStatus::Completed,
            Some("user-42"),
        );
        r.request_url = Some(format!("mem://traces/wf-{i}/op-{i}/request.json"));
        detections.push(detection_for(&r.correlation_id, &r.operation_id));
        records.push(r);
    }
    store.insert_batch(&records).await.unwrap();
    store.insert_detections(&detections).await.unwrap();

    let outcome = svc
        .erase("dpo", EraseSelector::Subject("user-42"), "erasure request", "Art. 17")
        .await
        .expect("erasure succeeds");

    assert_eq!(outcome.records_deleted, 3);
    assert_eq!(outcome.detections_deleted, 3);
    assert_eq!(outcome.payload_urls.len(), 3);

    // Subsequent queries come back empty.
    assert!(store.records_by_subject("user-42").await.unwrap().is_empty());
    assert!(store.detections().is_empty());

    // Exactly one audit row describing the call.
    let audits = store.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].access_type, AccessType::Delete);
    assert_eq!(audits[0].data_subject_id.as_deref(), Some("user-42"));
    assert_eq!(audits[0].results_count, 3);
}

// ── invariant: repeated erasure returns zero, audits each time ──

#[tokio::test]
async fn test_erasure_idempotent() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());
    store
        .insert_batch(&[make_record("wf-1", "op-1", ActionStatus::Completed, Some("u"))])
        .await
        .unwrap();

    let first = svc
        .erase("dpo", EraseSelector::Subject("u"), "req", "Art. 17")
        .await
        .unwrap();
    let second = svc
        .erase("dpo", EraseSelector::Subject("u"), "req", "Art. 17")
        .await
        .unwrap();
    let third = svc
        .erase("dpo", EraseSelector::Subject("u"), "req", "Art. 17")
        .await
        .unwrap();

    assert_eq!(first.records_deleted, 1);
    assert_eq!(second.records_deleted, 0);
    assert_eq!(third.records_deleted, 0);
    assert_eq!(store.audits().len(), 3, "every call audits, including no-ops");
}

// ── erasure by workflow ──

#[tokio::test]
async fn test_erasure_by_correlation_spares_other_workflows() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());
    store
        .insert_batch(&[
            make_record("wf-a", "op-1", ActionStatus::Completed, None),
            make_record("wf-a", "op-2", ActionStatus::Completed, None),
            make_record("wf-b", "op-3", ActionStatus::Completed, None),
        ])
        .await
        .unwrap();
    store
        .insert_detections(&[detection_for("wf-a", "op-1"), detection_for("wf-b", "op-3")])
        .await
        .unwrap();

    let outcome = svc
        .erase("dpo", EraseSelector::Correlation("wf-a"), "req", "Art. 17")
        .await
        .unwrap();

    assert_eq!(outcome.records_deleted, 2);
    assert_eq!(outcome.detections_deleted, 1);
    assert_eq!(store.records_by_correlation("wf-b").await.unwrap().len(), 1);
    assert_eq!(store.detections().len(), 1);
}

// ── pseudonymization ──

#[tokio::test]
async fn test_pseudonymization_end_to_end() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());

    let mut r = make_record("wf-1", "op-1", ActionStatus::Completed, Some("user-9"));
    r.metadata.insert("email".to_string(), "u9@example.com".into());
    r.metadata.insert("client_ip".to_string(), "10.1.2.3".into());
    r.metadata.insert("progress_percent".to_string(), 80.into());
    store.insert_batch(&[r]).await.unwrap();

    let touched = svc.pseudonymize("dpo", "user-9", "req", "Art. 17").await.unwrap();
    assert_eq!(touched, 1);

    let pseudonym = svc.pseudonym("user-9");
    let rows = store.records_by_subject(&pseudonym).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].metadata.contains_key("email"));
    assert_eq!(rows[0].metadata["client_ip"], serde_json::Value::Null);
    assert_eq!(rows[0].metadata["progress_percent"], serde_json::Value::from(80));

    let audits = store.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].access_type, AccessType::Pseudonymize);
}

// ── export ──

#[tokio::test]
async fn test_export_returns_newest_first_and_audits() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());

    let mut old = make_record("wf-1", "op-1", ActionStatus::Completed, Some("u"));
    old.started_at = Utc::now() - Duration::hours(3);
    let mid = {
        let mut r = make_record("wf-2", "op-2", ActionStatus::Failed, Some("u"));
        r.started_at = Utc::now() - Duration::hours(1);
        r
    };
    let new = make_record("wf-3", "op-3", ActionStatus::Completed, Some("u"));
    store.insert_batch(&[old, mid, new]).await.unwrap();

    let records = svc.export("dpo", "u", "portability", "Art. 20").await.unwrap();
    let order: Vec<&str> = records.iter().map(|r| r.correlation_id.as_str()).collect();
    assert_eq!(order, vec!["wf-3", "wf-2", "wf-1"]);

    let audits = store.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].access_type, AccessType::Export);
    assert_eq!(audits[0].results_count, 3);
}

// ── retention sweep ──

#[tokio::test]
async fn test_sweep_removes_only_expired_and_is_idempotent() {
    let store = Arc::new(MemoryTraceStore::new());
    let svc = service(store.clone());
    let now = Utc::now();

    let mut records = Vec::new();
    for i in 0..4 {
        let mut r = make_record(&format!("wf-{i}"), &format!("op-{i}"), ActionStatus::Completed, None);
        r.retention_until = Some(if i < 2 {
            now - Duration::days(1)
        } else {
            now + Duration::days(30)
        });
        records.push(r);
    }
    store.insert_batch(&records).await.unwrap();

    assert_eq!(svc.sweep_expired(now).await.unwrap(), 2);
    assert_eq!(store.records().len(), 2);
    for record in store.records() {
        assert!(record.retention_until.unwrap() >= now, "no expired rows remain");
    }

    assert_eq!(svc.sweep_expired(now).await.unwrap(), 0, "second sweep is a no-op");
    assert_eq!(store.audits().len(), 2, "one audit row per sweep batch");
    assert!(store.audits().iter().all(|a| a.user_id == "retention-sweep"));
}
