use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::gdpr::AuditEvent;
use crate::pii::PiiDetection;
use crate::record::{pseudonymize_metadata, ActionRecord};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql store: {0}")]
    Sql(String),
    #[error("object store: {0}")]
    Object(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/* ============================= CAPABILITY TRAITS ============================= */

/// The relational side of the split write. Only the operations the tracer
/// actually needs; the handle itself (pool, credentials, lifecycle) belongs
/// to the caller.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn insert_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError>;
    async fn insert_detections(&self, detections: &[PiiDetection]) -> Result<(), StoreError>;
    async fn insert_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Records for one data subject, newest first.
    async fn records_by_subject(&self, data_subject_id: &str)
        -> Result<Vec<ActionRecord>, StoreError>;
    async fn records_by_correlation(&self, correlation_id: &str)
        -> Result<Vec<ActionRecord>, StoreError>;

    /// Returns (records deleted, detections deleted).
    async fn delete_by_subject(&self, data_subject_id: &str) -> Result<(u64, u64), StoreError>;
    async fn delete_by_correlation(&self, correlation_id: &str) -> Result<(u64, u64), StoreError>;

    /// Rewrite the subject id and strip direct identifiers from metadata.
    /// Returns the number of records touched.
    async fn pseudonymize_subject(
        &self,
        data_subject_id: &str,
        pseudonym: &str,
    ) -> Result<u64, StoreError>;

    /// Delete every record whose retention deadline has passed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// The content-addressed side of the split write.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes and return a stable reference URL.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/* ============================= MEMORY TRACE STORE ============================= */

/// In-memory `TraceStore`, used by the test suites and the standalone serve
/// mode. Short lock sections only; no await while holding the lock.
#[derive(Default)]
pub struct MemoryTraceStore {
    records: Mutex<Vec<ActionRecord>>,
    detections: Mutex<Vec<PiiDetection>>,
    audits: Mutex<Vec<AuditEvent>>,
    fail_inserts: AtomicBool,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `insert_batch` calls fail, for retry-path tests.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ActionRecord> {
        self.records.lock().expect("records lock").clone()
    }

    pub fn detections(&self) -> Vec<PiiDetection> {
        self.detections.lock().expect("detections lock").clone()
    }

    pub fn audits(&self) -> Vec<AuditEvent> {
        self.audits.lock().expect("audits lock").clone()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn insert_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Sql("simulated insert failure".to_string()));
        }
        self.records.lock().expect("records lock").extend_from_slice(records);
        Ok(())
    }

    async fn insert_detections(&self, detections: &[PiiDetection]) -> Result<(), StoreError> {
        self.detections
            .lock()
            .expect("detections lock")
            .extend_from_slice(detections);
        Ok(())
    }

    async fn insert_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.audits.lock().expect("audits lock").push(event.clone());
        Ok(())
    }

    async fn records_by_subject(
        &self,
        data_subject_id: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let mut out: Vec<ActionRecord> = self
            .records
            .lock()
            .expect("records lock")
            .iter()
            .filter(|r| r.data_subject_id.as_deref() == Some(data_subject_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }

    async fn records_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let mut out: Vec<ActionRecord> = self
            .records
            .lock()
            .expect("records lock")
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }

    async fn delete_by_subject(&self, data_subject_id: &str) -> Result<(u64, u64), StoreError> {
        // Detections are linked through (correlation_id, operation_id), so
        // collect the doomed pairs before the records go away.
        let (records, doomed) = {
            let mut records = self.records.lock().expect("records lock");
            let doomed: Vec<(String, String)> = records
                .iter()
                .filter(|r| r.data_subject_id.as_deref() == Some(data_subject_id))
                .map(|r| (r.correlation_id.clone(), r.operation_id.clone()))
                .collect();
            let before = records.len();
            records.retain(|r| r.data_subject_id.as_deref() != Some(data_subject_id));
            ((before - records.len()) as u64, doomed)
        };
        let detections = {
            let mut detections = self.detections.lock().expect("detections lock");
            let before = detections.len();
            detections.retain(|d| {
                !doomed
                    .iter()
                    .any(|(c, o)| *c == d.correlation_id && *o == d.operation_id)
            });
            (before - detections.len()) as u64
        };
        Ok((records, detections))
    }

    async fn delete_by_correlation(&self, correlation_id: &str) -> Result<(u64, u64), StoreError> {
        let records = {
            let mut records = self.records.lock().expect("records lock");
            let before = records.len();
            records.retain(|r| r.correlation_id != correlation_id);
            (before - records.len()) as u64
        };
        let detections = {
            let mut detections = self.detections.lock().expect("detections lock");
            let before = detections.len();
            detections.retain(|d| d.correlation_id != correlation_id);
            (before - detections.len()) as u64
        };
        Ok((records, detections))
    }

    async fn pseudonymize_subject(
        &self,
        data_subject_id: &str,
        pseudonym: &str,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().expect("records lock");
        let mut touched = 0;
        for record in records.iter_mut() {
            if record.data_subject_id.as_deref() == Some(data_subject_id) {
                record.data_subject_id = Some(pseudonym.to_string());
                pseudonymize_metadata(&mut record.metadata);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().expect("records lock");
        let before = records.len();
        records.retain(|r| match r.retention_until {
            Some(until) => until >= now,
            None => true,
        });
        Ok((before - records.len()) as u64)
    }
}

/* ============================= MEMORY OBJECT STORE ============================= */

/// In-memory `ObjectStore` with a failure switch for partial-flush tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail_puts: AtomicBool,
}

fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `put_object` calls fail.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .expect("objects lock")
            .contains_key(&object_key(bucket, key))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Object("simulated upload failure".to_string()));
        }
        self.objects
            .lock()
            .expect("objects lock")
            .insert(object_key(bucket, key), (bytes, content_type.to_string()));
        Ok(format!("mem://{bucket}/{key}"))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&object_key(bucket, key))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(object_key(bucket, key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .expect("objects lock")
            .remove(&object_key(bucket, key));
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let full_prefix = object_key(bucket, prefix);
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("objects lock")
            .keys()
            .filter(|k| k.starts_with(&full_prefix))
            .map(|k| k[bucket.len() + 1..].to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use chrono::Duration;

    fn make_record(correlation: &str, operation: &str, subject: Option<&str>) -> ActionRecord {
        let ctx = RequestContext {
            correlation_id: correlation.to_string(),
            operation_id: operation.to_string(),
            parent_operation_id: None,
            service_id: "svc".to_string(),
        };
        let mut r = ActionRecord::start(&ctx, "CreateAction", "Thing", Utc::now());
        r.data_subject_id = subject.map(str::to_string);
        r
    }

    // ── memory trace store ──

    #[tokio::test]
    async fn test_insert_and_query_by_subject() {
        let store = MemoryTraceStore::new();
        store
            .insert_batch(&[
                make_record("wf-1", "op-1", Some("user-1")),
                make_record("wf-2", "op-2", Some("user-2")),
            ])
            .await
            .unwrap();

        let rows = store.records_by_subject("user-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].correlation_id, "wf-1");
    }

    #[tokio::test]
    async fn test_query_by_subject_newest_first() {
        let store = MemoryTraceStore::new();
        let mut old = make_record("wf-1", "op-1", Some("u"));
        old.started_at = Utc::now() - Duration::hours(2);
        let new = make_record("wf-2", "op-2", Some("u"));
        store.insert_batch(&[old, new]).await.unwrap();

        let rows = store.records_by_subject("u").await.unwrap();
        assert_eq!(rows[0].correlation_id, "wf-2");
        assert_eq!(rows[1].correlation_id, "wf-1");
    }

    #[tokio::test]
    async fn test_delete_by_subject_counts() {
        let store = MemoryTraceStore::new();
        store
            .insert_batch(&[
                make_record("wf-1", "op-1", Some("gone")),
                make_record("wf-2", "op-2", Some("kept")),
            ])
            .await
            .unwrap();

        let (records, _) = store.delete_by_subject("gone").await.unwrap();
        assert_eq!(records, 1);
        assert!(store.records_by_subject("gone").await.unwrap().is_empty());
        assert_eq!(store.records_by_subject("kept").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_subject_is_zero_not_error() {
        let store = MemoryTraceStore::new();
        let (records, detections) = store.delete_by_subject("nobody").await.unwrap();
        assert_eq!((records, detections), (0, 0));
    }

    #[tokio::test]
    async fn test_pseudonymize_rewrites_subject_and_metadata() {
        let store = MemoryTraceStore::new();
        let mut r = make_record("wf-1", "op-1", Some("user-9"));
        r.metadata.insert("email".to_string(), "x@y.z".into());
        store.insert_batch(&[r]).await.unwrap();

        let touched = store.pseudonymize_subject("user-9", "PSEUDONYMIZED-abcd").await.unwrap();
        assert_eq!(touched, 1);

        let rows = store.records_by_subject("PSEUDONYMIZED-abcd").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].metadata.contains_key("email"));
    }

    #[tokio::test]
    async fn test_delete_expired_only_past_deadlines() {
        let store = MemoryTraceStore::new();
        let now = Utc::now();
        let mut expired = make_record("wf-1", "op-1", None);
        expired.retention_until = Some(now - Duration::days(1));
        let mut live = make_record("wf-2", "op-2", None);
        live.retention_until = Some(now + Duration::days(30));
        let untracked = make_record("wf-3", "op-3", None);
        store.insert_batch(&[expired, live, untracked]).await.unwrap();

        let deleted = store.delete_expired(now).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_inserts_switch() {
        let store = MemoryTraceStore::new();
        store.fail_inserts(true);
        assert!(store.insert_batch(&[make_record("wf", "op", None)]).await.is_err());
        store.fail_inserts(false);
        assert!(store.insert_batch(&[make_record("wf", "op", None)]).await.is_ok());
    }

    // ── memory object store ──

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        let url = store
            .put_object("traces", "wf/op/request.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(url, "mem://traces/wf/op/request.json");
        assert_eq!(store.get_object("traces", "wf/op/request.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.get_object("traces", "nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["wf-1/op-1/request.json", "wf-1/op-2/request.json", "wf-2/op-3/request.json"] {
            store
                .put_object("traces", key, b"x".to_vec(), "application/json")
                .await
                .unwrap();
        }
        let keys = store.list_keys("traces", "wf-1/").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("wf-1/")));
    }

    #[tokio::test]
    async fn test_fail_puts_switch() {
        let store = MemoryObjectStore::new();
        store.fail_puts(true);
        assert!(store
            .put_object("b", "k", b"x".to_vec(), "application/json")
            .await
            .is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_object_idempotent() {
        let store = MemoryObjectStore::new();
        store
            .put_object("b", "k", b"x".to_vec(), "application/json")
            .await
            .unwrap();
        store.delete_object("b", "k").await.unwrap();
        store.delete_object("b", "k").await.unwrap();
        assert!(store.is_empty());
    }
}
