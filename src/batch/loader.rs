//! Concurrent Batch Loader
//!
//! Partitions a mapped dataset into fixed-size batches and runs them under a
//! bounded-concurrency pool. Records within a batch stay sequential so the
//! audit log keeps deterministic per-row ordering. Lifecycle events go out on
//! a channel; the loader never talks to subscriber connections directly.

use crate::batch::validation::validate_record;
use crate::batch::{
    BatchStatus, FieldMapping, ImportBatch, ImportRecordLog, ImportSession, LifecycleEvent,
    RecordStatus, SessionStatus,
};
use crate::error::{ImportError, Result};
use crate::storage::{failed_rows, ImportStorage};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Loader tuning knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// Rows per batch
    pub batch_size: usize,

    /// Batches processing concurrently
    pub concurrency: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 5,
        }
    }
}

/// Public snapshot of a session's in-flight metrics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub records_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub cancelled: bool,
}

/// Per-session in-memory state, owned by the loader while a run is active
struct ActiveSession {
    started: Instant,
    total: usize,
    processed: usize,
    successful: usize,
    failed: usize,
    cancelled: bool,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    /// Serializes every read-modify-write of this session's stored row, so
    /// a cancel cannot interleave with finalization or counter updates and
    /// regress a terminal status.
    gate: Arc<Mutex<()>>,
}

impl ActiveSession {
    fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.processed as f64 / elapsed
        } else {
            0.0
        }
    }

    fn eta_seconds(&self) -> Option<f64> {
        let rate = self.rate();
        if rate > 0.0 && self.processed < self.total {
            Some((self.total - self.processed) as f64 / rate)
        } else {
            None
        }
    }
}

/// Concurrent batch loader over the storage collaborator.
///
/// One instance serves the whole process; per-session state lives in the
/// internal map and is released when a session reaches a terminal status.
pub struct BatchLoader {
    storage: Arc<dyn ImportStorage>,
    options: LoaderOptions,
    active: Arc<DashMap<String, ActiveSession>>,
}

impl BatchLoader {
    pub fn new(storage: Arc<dyn ImportStorage>, options: LoaderOptions) -> Self {
        Self {
            storage,
            options,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Run one import session to completion.
    ///
    /// Returns the session in its terminal state. Row- and batch-level
    /// failures are absorbed into counters and the audit log; only explicit
    /// cancellation or a pre-batching error aborts the session.
    pub async fn run(
        &self,
        session_id: &str,
        entity_type: &str,
        records: Vec<Value>,
        mapping: Vec<FieldMapping>,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<ImportSession> {
        if self.active.contains_key(session_id) {
            return Err(ImportError::Session(format!(
                "session {} is already running",
                session_id
            )));
        }

        let mut session = ImportSession::new(
            session_id.to_string(),
            entity_type.to_string(),
            records.len(),
            mapping.clone(),
        );
        self.storage.create_session(&session).await?;

        // Pre-batching failures take the session straight to failed.
        if let Err(e) = preflight(entity_type, &records, &mapping) {
            session.status = SessionStatus::Failed;
            session.error = Some(e.to_string());
            session.updated_at = Utc::now();
            self.storage.update_session(&session).await?;
            let _ = events.send(LifecycleEvent::Error {
                session_id: session_id.to_string(),
                message: e.to_string(),
            });
            error!(session = session_id, "import failed before batching: {}", e);
            return Err(e);
        }

        self.active.insert(
            session_id.to_string(),
            ActiveSession {
                started: Instant::now(),
                total: records.len(),
                processed: 0,
                successful: 0,
                failed: 0,
                cancelled: false,
                events: events.clone(),
                gate: Arc::new(Mutex::new(())),
            },
        );

        // All batch rows exist before any processing starts.
        let batches = partition(session_id, &records, self.options.batch_size);
        for batch in &batches {
            self.storage.create_batch(batch).await?;
        }

        session.status = SessionStatus::Processing;
        session.updated_at = Utc::now();
        self.storage.update_session(&session).await?;
        self.emit_progress(session_id);
        info!(
            session = session_id,
            records = records.len(),
            batches = batches.len(),
            "import session started"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut handles = Vec::with_capacity(batches.len());

        for batch in batches {
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                ImportError::Session("batch scheduler semaphore closed".to_string())
            })?;
            let storage = Arc::clone(&self.storage);
            let active = Arc::clone(&self.active);
            let rows: Vec<Value> = records[batch.start_row..batch.end_row].to_vec();
            let mapping = mapping.clone();
            let entity_type = entity_type.to_string();
            let events = events.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_batch(storage, active, batch, rows, &entity_type, &mapping, events).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(session = session_id, "batch task panicked: {}", e);
            }
        }

        self.finalize(session_id).await
    }

    /// Force-cancel a processing session. Batches already in flight run to
    /// completion; their results are stored but no longer move the session.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let gate = match self.active.get(session_id) {
            Some(entry) => Arc::clone(&entry.gate),
            None => {
                return Err(ImportError::Session(format!(
                    "session {} is not active",
                    session_id
                )))
            }
        };
        let _guard = gate.lock().await;

        // Re-check under the gate: finalization may have released the
        // session while we waited for the lock.
        let events = match self.active.get_mut(session_id) {
            Some(mut entry) => {
                entry.cancelled = true;
                entry.events.clone()
            }
            None => {
                return Err(ImportError::Session(format!(
                    "session {} is not active",
                    session_id
                )))
            }
        };

        let mut session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| ImportError::Session(format!("unknown session {}", session_id)))?;

        if !session.status.can_transition_to(SessionStatus::Cancelled) {
            return Err(ImportError::Session(format!(
                "session {} is already terminal ({:?})",
                session_id, session.status
            )));
        }

        session.status = SessionStatus::Cancelled;
        session.updated_at = Utc::now();
        self.storage.update_session(&session).await?;
        let _ = events.send(LifecycleEvent::Cancelled {
            session_id: session_id.to_string(),
        });
        info!(session = session_id, "import session cancelled");
        Ok(())
    }

    /// Re-run exactly the rows logged as failed, as a fresh session with the
    /// original mapping.
    pub async fn retry_failed(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<ImportSession> {
        let original = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| ImportError::Session(format!("unknown session {}", session_id)))?;
        if !original.status.is_terminal() {
            return Err(ImportError::Session(format!(
                "session {} has not finished; cannot retry yet",
                session_id
            )));
        }

        let failed = failed_rows(self.storage.as_ref(), session_id).await?;
        let records: Vec<Value> = failed
            .into_iter()
            .filter_map(|log| log.source_record)
            .collect();
        if records.is_empty() {
            return Err(ImportError::Session(format!(
                "session {} has no retryable failed rows",
                session_id
            )));
        }

        let retry_id = Uuid::new_v4().to_string();
        info!(
            original = session_id,
            retry = %retry_id,
            rows = records.len(),
            "retrying failed rows"
        );
        self.run(
            &retry_id,
            &original.entity_type,
            records,
            original.mapping,
            events,
        )
        .await
    }

    /// Current in-flight metrics for a session, if it is active.
    pub fn session_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        self.active.get(session_id).map(|state| SessionMetrics {
            session_id: session_id.to_string(),
            total: state.total,
            processed: state.processed,
            successful: state.successful,
            failed: state.failed,
            records_per_second: state.rate(),
            eta_seconds: state.eta_seconds(),
            cancelled: state.cancelled,
        })
    }

    fn emit_progress(&self, session_id: &str) {
        if let Some(state) = self.active.get(session_id) {
            let _ = state.events.send(LifecycleEvent::Progress {
                session_id: session_id.to_string(),
                processed: state.processed,
                successful: state.successful,
                failed: state.failed,
                total: state.total,
                records_per_second: state.rate(),
                eta_seconds: state.eta_seconds(),
            });
        }
    }

    /// Write the terminal status and release in-memory state.
    async fn finalize(&self, session_id: &str) -> Result<ImportSession> {
        let gate = {
            let state = self.active.get(session_id).ok_or_else(|| {
                ImportError::Session(format!("session {} lost its metrics state", session_id))
            })?;
            Arc::clone(&state.gate)
        };
        let guard = gate.lock().await;

        let (successful, failed, processed, rate, events, was_cancelled) = {
            let state = self.active.get(session_id).ok_or_else(|| {
                ImportError::Session(format!("session {} lost its metrics state", session_id))
            })?;
            (
                state.successful,
                state.failed,
                state.processed,
                state.rate(),
                state.events.clone(),
                state.cancelled,
            )
        };

        let mut session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| ImportError::Session(format!("unknown session {}", session_id)))?;

        session.processed_records = processed;
        session.successful_records = successful;
        session.failed_records = failed;
        session.records_per_second = rate;
        session.eta_seconds = None;
        session.updated_at = Utc::now();

        if !session.status.is_terminal() {
            session.status = if failed == 0 {
                SessionStatus::Completed
            } else {
                SessionStatus::CompletedWithErrors
            };
            let event = if failed == 0 {
                LifecycleEvent::Completed {
                    session_id: session_id.to_string(),
                    successful,
                    failed,
                }
            } else {
                LifecycleEvent::CompletedWithErrors {
                    session_id: session_id.to_string(),
                    successful,
                    failed,
                }
            };
            let _ = events.send(event);
        } else if was_cancelled {
            debug!(session = session_id, "late batch results ignored for cancelled session");
        }

        self.storage.update_session(&session).await?;
        drop(guard);
        self.active.remove(session_id);
        info!(
            session = session_id,
            status = ?session.status,
            successful, failed, "import session finished"
        );
        Ok(session)
    }
}

/// Checks that must pass before any batch row is created.
fn preflight(entity_type: &str, records: &[Value], mapping: &[FieldMapping]) -> Result<()> {
    if !crate::batch::validation::known_entity(entity_type) {
        return Err(ImportError::Session(format!(
            "unknown entity type: {}",
            entity_type
        )));
    }
    if records.is_empty() {
        return Err(ImportError::Session("dataset has no records".to_string()));
    }
    if mapping.is_empty() {
        return Err(ImportError::Mapping("field mapping is empty".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for m in mapping {
        if !seen.insert(&m.target_field) {
            return Err(ImportError::Mapping(format!(
                "duplicate target field in mapping: {}",
                m.target_field
            )));
        }
    }
    Ok(())
}

/// Fixed-size partitioning; batch numbering is stable from creation.
fn partition(session_id: &str, records: &[Value], batch_size: usize) -> Vec<ImportBatch> {
    let batch_size = batch_size.max(1);
    (0..records.len())
        .step_by(batch_size)
        .enumerate()
        .map(|(number, start)| {
            let end = (start + batch_size).min(records.len());
            ImportBatch {
                session_id: session_id.to_string(),
                batch_number: number,
                start_row: start,
                end_row: end,
                record_count: end - start,
                status: BatchStatus::Pending,
                success_count: 0,
                failure_count: 0,
                started_at: None,
                completed_at: None,
            }
        })
        .collect()
}

/// Copy only the mapped fields into the entity record shape.
fn apply_mapping(record: &Value, mapping: &[FieldMapping]) -> Value {
    let mut out = Map::new();
    for m in mapping {
        if let Some(value) = record.get(&m.source_field) {
            out.insert(m.target_field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

/// Process one batch to completion. Never propagates an error to siblings:
/// a batch-level failure marks this batch failed and moves on.
async fn run_batch(
    storage: Arc<dyn ImportStorage>,
    active: Arc<DashMap<String, ActiveSession>>,
    mut batch: ImportBatch,
    rows: Vec<Value>,
    entity_type: &str,
    mapping: &[FieldMapping],
    events: mpsc::UnboundedSender<LifecycleEvent>,
) {
    let session_id = batch.session_id.clone();
    batch.status = BatchStatus::Processing;
    batch.started_at = Some(Utc::now());
    if let Err(e) = storage.update_batch(&batch).await {
        warn!(session = %session_id, batch = batch.batch_number, "failed to mark batch processing: {}", e);
    }

    let outcome = process_rows(
        storage.as_ref(),
        &batch,
        &rows,
        entity_type,
        mapping,
    )
    .await;

    match outcome {
        Ok((success_count, failure_count)) => {
            batch.status = BatchStatus::Completed;
            batch.success_count = success_count;
            batch.failure_count = failure_count;
            batch.completed_at = Some(Utc::now());
            if let Err(e) = storage.update_batch(&batch).await {
                warn!(session = %session_id, batch = batch.batch_number, "failed to persist batch completion: {}", e);
            }

            update_session_counters(&storage, &active, &session_id, &batch).await;
            let _ = events.send(LifecycleEvent::BatchCompleted {
                session_id: session_id.clone(),
                batch_number: batch.batch_number,
                success_count,
                failure_count,
            });
            debug!(
                session = %session_id,
                batch = batch.batch_number,
                success_count, failure_count, "batch completed"
            );
        }
        Err((success_count, attempted_failures, e)) => {
            // Unattempted rows count as failed; siblings are unaffected.
            batch.status = BatchStatus::Failed;
            batch.success_count = success_count;
            batch.failure_count = batch.record_count - success_count;
            batch.completed_at = Some(Utc::now());
            if let Err(persist_err) = storage.update_batch(&batch).await {
                warn!(session = %session_id, batch = batch.batch_number, "failed to persist batch failure: {}", persist_err);
            }

            update_session_counters(&storage, &active, &session_id, &batch).await;
            let _ = events.send(LifecycleEvent::BatchFailed {
                session_id: session_id.clone(),
                batch_number: batch.batch_number,
                error: e.to_string(),
            });
            error!(
                session = %session_id,
                batch = batch.batch_number,
                attempted_failures, "batch failed: {}", e
            );
        }
    }

    // One progress tick per finished batch.
    if let Some(state) = active.get(&session_id) {
        let _ = events.send(LifecycleEvent::Progress {
            session_id: session_id.clone(),
            processed: state.processed,
            successful: state.successful,
            failed: state.failed,
            total: state.total,
            records_per_second: state.rate(),
            eta_seconds: state.eta_seconds(),
        });
    }
}

/// Sequential per-record loop. Returns (successes, failures), or on a
/// batch-level error the counts reached so far plus the error.
async fn process_rows(
    storage: &dyn ImportStorage,
    batch: &ImportBatch,
    rows: &[Value],
    entity_type: &str,
    mapping: &[FieldMapping],
) -> std::result::Result<(usize, usize), (usize, usize, ImportError)> {
    let mut success_count = 0usize;
    let mut failure_count = 0usize;

    for (offset, row) in rows.iter().enumerate() {
        let row_index = batch.start_row + offset;
        let mapped = apply_mapping(row, mapping);
        let validated = validate_record(entity_type, &mapped);

        let log = if validated.is_valid() {
            match storage.insert_entity(entity_type, &validated.record).await {
                Ok(entity_id) => {
                    success_count += 1;
                    ImportRecordLog {
                        session_id: batch.session_id.clone(),
                        batch_number: batch.batch_number,
                        row_index,
                        status: RecordStatus::Success,
                        entity_id: Some(entity_id),
                        errors: validated
                            .warnings
                            .iter()
                            .map(|w| format!("auto-fixed {}: {}", w.field, w.message))
                            .collect(),
                        auto_fixable: false,
                        source_record: None,
                    }
                }
                Err(e) => {
                    failure_count += 1;
                    ImportRecordLog {
                        session_id: batch.session_id.clone(),
                        batch_number: batch.batch_number,
                        row_index,
                        status: RecordStatus::Failed,
                        entity_id: None,
                        errors: vec![format!("persistence failed: {}", e)],
                        auto_fixable: false,
                        source_record: Some(row.clone()),
                    }
                }
            }
        } else {
            failure_count += 1;
            ImportRecordLog {
                session_id: batch.session_id.clone(),
                batch_number: batch.batch_number,
                row_index,
                status: RecordStatus::Failed,
                entity_id: None,
                errors: validated
                    .errors
                    .iter()
                    .map(|e| match &e.suggestion {
                        Some(s) => format!("{} ({})", e.message, s),
                        None => e.message.clone(),
                    })
                    .collect(),
                auto_fixable: validated.errors.iter().any(|e| e.auto_fixable),
                source_record: Some(row.clone()),
            }
        };

        storage
            .append_record_log(&log)
            .await
            .map_err(|e| (success_count, failure_count, e))?;
    }

    Ok((success_count, failure_count))
}

/// Fold a finished batch into the session's in-memory metrics and mirror the
/// snapshot onto the stored session row (unless the session went terminal).
async fn update_session_counters(
    storage: &Arc<dyn ImportStorage>,
    active: &Arc<DashMap<String, ActiveSession>>,
    session_id: &str,
    batch: &ImportBatch,
) {
    let snapshot = {
        match active.get_mut(session_id) {
            Some(mut state) => {
                state.processed += batch.record_count;
                state.successful += batch.success_count;
                state.failed += batch.failure_count;
                Some((
                    state.processed,
                    state.successful,
                    state.failed,
                    state.rate(),
                    Arc::clone(&state.gate),
                ))
            }
            None => None,
        }
    };

    if let Some((processed, successful, failed, rate, gate)) = snapshot {
        let _guard = gate.lock().await;
        match storage.get_session(session_id).await {
            Ok(Some(mut session)) if !session.status.is_terminal() => {
                session.processed_records = processed;
                session.successful_records = successful;
                session.failed_records = failed;
                session.records_per_second = rate;
                session.updated_at = Utc::now();
                if let Err(e) = storage.update_session(&session).await {
                    warn!(session = session_id, "failed to persist session counters: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(session = session_id, "failed to load session for counters: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn loader() -> (BatchLoader, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let loader = BatchLoader::new(storage.clone(), LoaderOptions::default());
        (loader, storage)
    }

    fn product_rows(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"Product Name": format!("Item {}", i), "Unit Price": "9.99"}))
            .collect()
    }

    fn product_mapping() -> Vec<FieldMapping> {
        vec![
            FieldMapping::new("Product Name", "name"),
            FieldMapping::new("Unit Price", "price"),
        ]
    }

    #[test]
    fn test_partition_250_rows_into_3_batches() {
        let rows = product_rows(250);
        let batches = partition("s1", &rows, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].record_count, 100);
        assert_eq!(batches[1].record_count, 100);
        assert_eq!(batches[2].record_count, 50);
        assert_eq!(batches[2].start_row, 200);
        assert_eq!(batches[2].end_row, 250);
    }

    #[tokio::test]
    async fn test_full_run_counts_reconcile() {
        let (loader, storage) = loader();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = loader
            .run("s1", "product", product_rows(250), product_mapping(), tx)
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.processed_records, 250);
        assert_eq!(session.successful_records, 250);
        assert_eq!(session.failed_records, 0);
        assert_eq!(storage.entity_count(), 250);

        let batches = storage.batches_for_session("s1").await.unwrap();
        assert_eq!(batches.len(), 3);
        let total: usize = batches.iter().map(|b| b.success_count + b.failure_count).sum();
        assert_eq!(total, 250);

        // Audit log reconciles with the aggregates.
        let logs = storage.record_logs_for_session("s1").await.unwrap();
        assert_eq!(logs.len(), 250);

        // A completed event must have been emitted.
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LifecycleEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_negative_price_fixed_and_missing_name_failed() {
        let (loader, storage) = loader();
        let (tx, _rx) = mpsc::unbounded_channel();

        let rows = vec![
            json!({"Product Name": "X", "Unit Price": "-5"}),
            json!({"Unit Price": "3.00"}),
        ];
        let session = loader
            .run("s1", "product", rows, product_mapping(), tx)
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::CompletedWithErrors);
        assert_eq!(session.successful_records, 1);
        assert_eq!(session.failed_records, 1);

        let logs = storage.record_logs_for_session("s1").await.unwrap();
        let fixed = logs.iter().find(|l| l.row_index == 0).unwrap();
        assert_eq!(fixed.status, RecordStatus::Success);
        assert!(fixed.errors.iter().any(|e| e.contains("auto-fixed")));

        let failed = logs.iter().find(|l| l.row_index == 1).unwrap();
        assert_eq!(failed.status, RecordStatus::Failed);
        assert!(failed.source_record.is_some());
        assert_eq!(storage.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_mapping_fails_session_before_batching() {
        let (loader, storage) = loader();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = loader
            .run("s1", "product", product_rows(5), Vec::new(), tx)
            .await;
        assert!(result.is_err());

        let session = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.is_some());
        assert!(storage.batches_for_session("s1").await.unwrap().is_empty());

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, LifecycleEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_unknown_entity_type_rejected() {
        let (loader, _storage) = loader();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(loader
            .run("s1", "starship", product_rows(5), product_mapping(), tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_run_rejected_while_active() {
        let (loader, _storage) = loader();
        let loader = Arc::new(loader);
        let (tx, _rx) = mpsc::unbounded_channel();

        // First run completes; a rerun with the same id is a new storage
        // session conflict, not a silent merge.
        loader
            .run("s1", "product", product_rows(5), product_mapping(), tx.clone())
            .await
            .unwrap();
        assert!(loader
            .run("s1", "product", product_rows(5), product_mapping(), tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_session_stays_cancelled() {
        let (loader, storage) = loader();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Seed an active session by hand to cancel it deterministically
        // mid-flight.
        let session = ImportSession::new(
            "s1".to_string(),
            "product".to_string(),
            10,
            product_mapping(),
        );
        storage.create_session(&session).await.unwrap();
        let mut processing = session.clone();
        processing.status = SessionStatus::Processing;
        storage.update_session(&processing).await.unwrap();
        loader.active.insert(
            "s1".to_string(),
            ActiveSession {
                started: Instant::now(),
                total: 10,
                processed: 0,
                successful: 0,
                failed: 0,
                cancelled: false,
                events: tx.clone(),
                gate: Arc::new(Mutex::new(())),
            },
        );

        loader.cancel("s1").await.unwrap();
        let stored = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
        assert!(matches!(rx.try_recv().unwrap(), LifecycleEvent::Cancelled { .. }));

        // Finalize after cancellation must not flip the status.
        let finalized = loader.finalize("s1").await.unwrap();
        assert_eq!(finalized.status, SessionStatus::Cancelled);
        assert!(loader.session_metrics("s1").is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_rows_only() {
        let (loader, storage) = loader();
        let (tx, _rx) = mpsc::unbounded_channel();

        let rows = vec![
            json!({"Product Name": "Good", "Unit Price": "1.00"}),
            json!({"Unit Price": "2.00"}),
            json!({"Unit Price": "3.00"}),
        ];
        loader
            .run("s1", "product", rows, product_mapping(), tx.clone())
            .await
            .unwrap();

        // Both failed rows come back in a fresh session; they fail again
        // (still no name) which proves exactly the failed subset reran.
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let retry = loader.retry_failed("s1", tx2).await.unwrap();
        assert_eq!(retry.total_records, 2);
        assert_eq!(retry.entity_type, "product");
        assert_eq!(retry.failed_records, 2);

        let logs = storage.record_logs_for_session(&retry.id).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    /// Storage wrapper that parks the first terminal-status session write
    /// until the test releases it, exposing the cancel/finalize window.
    struct HoldTerminalWrite {
        inner: MemoryStorage,
        parked: Arc<Notify>,
        release: Arc<Notify>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl ImportStorage for HoldTerminalWrite {
        async fn create_session(&self, session: &ImportSession) -> Result<()> {
            self.inner.create_session(session).await
        }

        async fn update_session(&self, session: &ImportSession) -> Result<()> {
            if session.status.is_terminal() && self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            self.inner.update_session(session).await
        }

        async fn get_session(&self, session_id: &str) -> Result<Option<ImportSession>> {
            self.inner.get_session(session_id).await
        }

        async fn create_batch(&self, batch: &ImportBatch) -> Result<()> {
            self.inner.create_batch(batch).await
        }

        async fn update_batch(&self, batch: &ImportBatch) -> Result<()> {
            self.inner.update_batch(batch).await
        }

        async fn batches_for_session(&self, session_id: &str) -> Result<Vec<ImportBatch>> {
            self.inner.batches_for_session(session_id).await
        }

        async fn append_record_log(&self, log: &ImportRecordLog) -> Result<()> {
            self.inner.append_record_log(log).await
        }

        async fn record_logs_for_session(&self, session_id: &str) -> Result<Vec<ImportRecordLog>> {
            self.inner.record_logs_for_session(session_id).await
        }

        async fn insert_entity(&self, entity_type: &str, record: &Value) -> Result<String> {
            self.inner.insert_entity(entity_type, record).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_finalization_cannot_regress_status() {
        let parked = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let storage = Arc::new(HoldTerminalWrite {
            inner: MemoryStorage::new(),
            parked: parked.clone(),
            release: release.clone(),
            armed: AtomicBool::new(true),
        });
        let loader = Arc::new(BatchLoader::new(storage.clone(), LoaderOptions::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move {
                loader
                    .run("s1", "product", product_rows(5), product_mapping(), tx)
                    .await
            }
        });

        // Finalization is now holding its terminal write; a cancel arriving
        // in this window must either win outright or be rejected, never be
        // silently overwritten.
        parked.notified().await;
        let cancel = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.cancel("s1").await }
        });
        tokio::task::yield_now().await;
        release.notify_one();

        run.await.unwrap().unwrap();
        let cancel_result = cancel.await.unwrap();
        let stored = storage.inner.get_session("s1").await.unwrap().unwrap();
        match cancel_result {
            Ok(()) => assert_eq!(stored.status, SessionStatus::Cancelled),
            Err(_) => assert_eq!(stored.status, SessionStatus::Completed),
        }

        // Subscribers must never see both terminal outcomes.
        let mut saw_completed = false;
        let mut saw_cancelled = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LifecycleEvent::Completed { .. } | LifecycleEvent::CompletedWithErrors { .. } => {
                    saw_completed = true
                }
                LifecycleEvent::Cancelled { .. } => saw_cancelled = true,
                _ => {}
            }
        }
        assert!(saw_completed != saw_cancelled);
    }

    /// Storage wrapper whose record-log append fails for one row, taking
    /// down its whole batch.
    struct FailingLogStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl ImportStorage for FailingLogStorage {
        async fn create_session(&self, session: &ImportSession) -> Result<()> {
            self.inner.create_session(session).await
        }

        async fn update_session(&self, session: &ImportSession) -> Result<()> {
            self.inner.update_session(session).await
        }

        async fn get_session(&self, session_id: &str) -> Result<Option<ImportSession>> {
            self.inner.get_session(session_id).await
        }

        async fn create_batch(&self, batch: &ImportBatch) -> Result<()> {
            self.inner.create_batch(batch).await
        }

        async fn update_batch(&self, batch: &ImportBatch) -> Result<()> {
            self.inner.update_batch(batch).await
        }

        async fn batches_for_session(&self, session_id: &str) -> Result<Vec<ImportBatch>> {
            self.inner.batches_for_session(session_id).await
        }

        async fn append_record_log(&self, log: &ImportRecordLog) -> Result<()> {
            if log.row_index == 1 {
                return Err(ImportError::Storage("record log write failed".to_string()));
            }
            self.inner.append_record_log(log).await
        }

        async fn record_logs_for_session(&self, session_id: &str) -> Result<Vec<ImportRecordLog>> {
            self.inner.record_logs_for_session(session_id).await
        }

        async fn insert_entity(&self, entity_type: &str, record: &Value) -> Result<String> {
            self.inner.insert_entity(entity_type, record).await
        }
    }

    #[tokio::test]
    async fn test_batch_level_failure_leaves_siblings_untouched() {
        let storage = Arc::new(FailingLogStorage {
            inner: MemoryStorage::new(),
        });
        let loader = BatchLoader::new(
            storage.clone(),
            LoaderOptions {
                batch_size: 3,
                concurrency: 2,
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Row 1 kills batch 0 mid-flight; rows 3..6 make up batch 1.
        let session = loader
            .run("s1", "product", product_rows(6), product_mapping(), tx)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::CompletedWithErrors);

        let batches = storage.inner.batches_for_session("s1").await.unwrap();
        assert_eq!(batches.len(), 2);

        // The failed batch counts its unattempted rows as failures.
        assert_eq!(batches[0].status, BatchStatus::Failed);
        assert_eq!(
            batches[0].failure_count,
            batches[0].record_count - batches[0].success_count
        );

        // The sibling batch completes in full.
        assert_eq!(batches[1].status, BatchStatus::Completed);
        assert_eq!(batches[1].success_count, 3);
        assert_eq!(batches[1].failure_count, 0);

        let mut saw_batch_failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LifecycleEvent::BatchFailed { .. }) {
                saw_batch_failed = true;
            }
        }
        assert!(saw_batch_failed);
    }
}
