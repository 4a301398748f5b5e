use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::{
    EXPORTER_BATCH_FLUSHES_TOTAL, EXPORTER_DROPPED_TOTAL, EXPORTER_QUEUE_SIZE,
    EXPORTER_SQL_FAILURES_TOTAL,
};
use crate::pii::PiiDetection;
use crate::record::ActionRecord;
use crate::store::{ObjectStore, TraceStore};

/* ============================= CONFIG ============================= */

/// Queue and worker sizing for the async exporter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub workers: usize,
    #[serde(with = "duration_secs")]
    pub flush_period: Duration,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            workers: 4,
            flush_period: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Where payloads land in the object store.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub bucket: String,
    /// Prepended verbatim to every key; include a trailing slash if wanted.
    pub prefix: String,
    pub store_payload: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { bucket: "traces".to_string(), prefix: String::new(), store_payload: true }
    }
}

/* ============================= EXPORT RECORD ============================= */

/// A completed record plus the payload bytes that travel with it to the
/// object store. Detections flush in the same batch as their record.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub record: ActionRecord,
    pub request_body: Option<Vec<u8>>,
    pub response_body: Option<Vec<u8>>,
    pub logs: Option<Vec<u8>>,
    pub detections: Vec<PiiDetection>,
}

impl ExportRecord {
    pub fn new(record: ActionRecord) -> Self {
        Self { record, request_body: None, response_body: None, logs: None, detections: Vec::new() }
    }
}

/* ============================= BACKOFF ============================= */

const SQL_RETRY_ATTEMPTS: u32 = 5;
const SQL_RETRY_BASE: Duration = Duration::from_millis(100);

/* ============================= EXPORTER ============================= */

/// Bounded-queue, worker-pool exporter.
///
/// `enqueue` never blocks: a full queue drops the record and bumps a counter.
/// Each worker owns its batch buffer; the only shared state is the channel
/// and the atomic counters.
pub struct AsyncExporter {
    tx: Option<flume::Sender<ExportRecord>>,
    workers: Vec<JoinHandle<()>>,
    accepting: Arc<AtomicBool>,
    queued: Arc<AtomicI64>,
}

impl AsyncExporter {
    /// Spawn the worker pool and return the handle.
    ///
    /// A zero queue size yields an exporter that drops everything without
    /// worker activity.
    pub fn start(
        config: AsyncConfig,
        options: ExportOptions,
        trace_store: Arc<dyn TraceStore>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        let accepting = Arc::new(AtomicBool::new(config.queue_size > 0));
        let queued = Arc::new(AtomicI64::new(0));

        if config.queue_size == 0 {
            return Self { tx: None, workers: Vec::new(), accepting, queued };
        }

        let (tx, rx) = flume::bounded::<ExportRecord>(config.queue_size);
        let options = Arc::new(options);

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let trace_store = trace_store.clone();
                let object_store = object_store.clone();
                let options = options.clone();
                let queued = queued.clone();
                let batch_size = config.batch_size.max(1);
                let flush_period = config.flush_period;
                tokio::spawn(async move {
                    worker_loop(
                        worker_id,
                        rx,
                        trace_store,
                        object_store,
                        options,
                        queued,
                        batch_size,
                        flush_period,
                    )
                    .await;
                })
            })
            .collect();

        Self { tx: Some(tx), workers, accepting, queued }
    }

    /// Non-blocking enqueue. Returns whether the record was accepted.
    pub fn enqueue(&self, record: ExportRecord) -> bool {
        debug_assert!(
            !record.record.contains_pii || record.record.pii_redacted,
            "unredacted PII must not reach the exporter"
        );

        if !self.accepting.load(Ordering::SeqCst) {
            EXPORTER_DROPPED_TOTAL.inc();
            return false;
        }
        let Some(tx) = &self.tx else {
            EXPORTER_DROPPED_TOTAL.inc();
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                EXPORTER_QUEUE_SIZE.inc();
                true
            }
            Err(_) => {
                EXPORTER_DROPPED_TOTAL.inc();
                false
            }
        }
    }

    /// Records accepted but not yet flushed.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst).max(0) as usize
    }

    /// Stop accepting, drain up to `timeout`, and return how many records
    /// were still unsent when the deadline hit.
    pub async fn close(mut self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        // Dropping the sender lets workers run the channel dry and exit.
        self.tx.take();

        let drained = tokio::time::timeout(timeout, join_all(self.workers.drain(..))).await;
        if drained.is_err() {
            warn!("exporter_close_timed_out");
        }
        let unsent = self.pending();
        info!(unsent, "exporter_closed");
        unsent
    }
}

/* ============================= WORKER LOOP ============================= */

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    rx: flume::Receiver<ExportRecord>,
    trace_store: Arc<dyn TraceStore>,
    object_store: Arc<dyn ObjectStore>,
    options: Arc<ExportOptions>,
    queued: Arc<AtomicI64>,
    batch_size: usize,
    flush_period: Duration,
) {
    let mut buffer: Vec<ExportRecord> = Vec::with_capacity(batch_size);

    loop {
        // Block for the first element of the next batch; a closed and empty
        // channel means shutdown.
        let first = match rx.recv_async().await {
            Ok(record) => record,
            Err(_) => break,
        };
        queued.fetch_sub(1, Ordering::SeqCst);
        EXPORTER_QUEUE_SIZE.dec();
        buffer.push(first);

        // Top up until the batch fills or the flush period since the first
        // element elapses.
        let deadline = Instant::now() + flush_period;
        while buffer.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                Ok(Ok(record)) => {
                    queued.fetch_sub(1, Ordering::SeqCst);
                    EXPORTER_QUEUE_SIZE.dec();
                    buffer.push(record);
                }
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        flush_batch(&mut buffer, trace_store.as_ref(), object_store.as_ref(), &options).await;
    }

    if !buffer.is_empty() {
        flush_batch(&mut buffer, trace_store.as_ref(), object_store.as_ref(), &options).await;
    }
    info!(worker = worker_id, "exporter_worker_stopped");
}

/* ============================= FLUSH ============================= */

/// Flush one batch: upload payloads, then insert all metadata rows at once.
///
/// Upload failures degrade the row (`payload_upload_failed` metadata, null
/// URL) but never block persistence. The insert retries with bounded
/// exponential backoff; exhaustion drops the batch.
pub(crate) async fn flush_batch(
    buffer: &mut Vec<ExportRecord>,
    trace_store: &dyn TraceStore,
    object_store: &dyn ObjectStore,
    options: &ExportOptions,
) {
    let mut records = Vec::with_capacity(buffer.len());
    let mut detections = Vec::new();

    for mut entry in buffer.drain(..) {
        if options.store_payload {
            upload_payloads(&mut entry, object_store, options).await;
        }
        detections.append(&mut entry.detections);
        records.push(entry.record);
    }

    let mut delay = SQL_RETRY_BASE;
    let mut inserted = false;
    for attempt in 1..=SQL_RETRY_ATTEMPTS {
        match trace_store.insert_batch(&records).await {
            Ok(()) => {
                inserted = true;
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "exporter_insert_failed");
                if attempt < SQL_RETRY_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    if !inserted {
        EXPORTER_SQL_FAILURES_TOTAL.inc();
        warn!(dropped = records.len(), "exporter_batch_dropped");
        return;
    }

    if !detections.is_empty() {
        if let Err(e) = trace_store.insert_detections(&detections).await {
            warn!(error = %e, "exporter_detections_insert_failed");
        }
    }

    EXPORTER_BATCH_FLUSHES_TOTAL.inc();
}

async fn upload_payloads(
    entry: &mut ExportRecord,
    object_store: &dyn ObjectStore,
    options: &ExportOptions,
) {
    let correlation = entry.record.correlation_id.clone();
    let operation = entry.record.operation_id.clone();

    let parts: [(&Option<Vec<u8>>, &str); 3] = [
        (&entry.request_body, "request"),
        (&entry.response_body, "response"),
        (&entry.logs, "logs"),
    ];

    let mut uploaded: [Option<(String, i64)>; 3] = [None, None, None];
    let mut any_failed = false;

    for (i, (body, kind)) in parts.iter().enumerate() {
        let Some(bytes) = body else { continue };
        if bytes.is_empty() {
            continue;
        }
        let key = format!("{}{}/{}/{}.json", options.prefix, correlation, operation, kind);
        match object_store
            .put_object(&options.bucket, &key, bytes.clone(), "application/json")
            .await
        {
            Ok(url) => uploaded[i] = Some((url, bytes.len() as i64)),
            Err(e) => {
                any_failed = true;
                warn!(key = %key, error = %e, "payload_upload_failed");
            }
        }
    }

    if let Some((url, size)) = uploaded[0].take() {
        entry.record.request_url = Some(url);
        entry.record.request_size_bytes = size;
    }
    if let Some((url, size)) = uploaded[1].take() {
        entry.record.response_url = Some(url);
        entry.record.response_size_bytes = size;
    }
    if let Some((url, size)) = uploaded[2].take() {
        entry.record.logs_url = Some(url);
        entry.record.logs_size_bytes = size;
    }

    if any_failed {
        entry
            .record
            .metadata
            .insert("payload_upload_failed".to_string(), Value::Bool(true));
    }
}
