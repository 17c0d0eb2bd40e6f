//! Storage collaborator boundary
//!
//! The core never talks to a concrete storage engine; it goes through this
//! trait. The contract is small on purpose: atomic per-row upsert plus a few
//! range/filter reads. The bundled in-memory implementation backs tests and
//! the demo CLI; production deployments supply their own.

use crate::batch::{ImportBatch, ImportRecordLog, ImportSession, RecordStatus};
use crate::error::{ImportError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait ImportStorage: Send + Sync {
    async fn create_session(&self, session: &ImportSession) -> Result<()>;
    async fn update_session(&self, session: &ImportSession) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<ImportSession>>;

    async fn create_batch(&self, batch: &ImportBatch) -> Result<()>;
    async fn update_batch(&self, batch: &ImportBatch) -> Result<()>;
    async fn batches_for_session(&self, session_id: &str) -> Result<Vec<ImportBatch>>;

    async fn append_record_log(&self, log: &ImportRecordLog) -> Result<()>;
    async fn record_logs_for_session(&self, session_id: &str) -> Result<Vec<ImportRecordLog>>;

    /// Persist one validated entity record, returning the generated id.
    async fn insert_entity(&self, entity_type: &str, record: &Value) -> Result<String>;
}

/// In-memory storage used by tests and the demo binary.
pub struct MemoryStorage {
    sessions: DashMap<String, ImportSession>,
    batches: DashMap<(String, usize), ImportBatch>,
    record_logs: Mutex<Vec<ImportRecordLog>>,
    entities: DashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            batches: DashMap::new(),
            record_logs: Mutex::new(Vec::new()),
            entities: DashMap::new(),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImportStorage for MemoryStorage {
    async fn create_session(&self, session: &ImportSession) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(ImportError::Session(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &ImportSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ImportSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn create_batch(&self, batch: &ImportBatch) -> Result<()> {
        self.batches
            .insert((batch.session_id.clone(), batch.batch_number), batch.clone());
        Ok(())
    }

    async fn update_batch(&self, batch: &ImportBatch) -> Result<()> {
        self.batches
            .insert((batch.session_id.clone(), batch.batch_number), batch.clone());
        Ok(())
    }

    async fn batches_for_session(&self, session_id: &str) -> Result<Vec<ImportBatch>> {
        let mut batches: Vec<ImportBatch> = self
            .batches
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        batches.sort_by_key(|b| b.batch_number);
        Ok(batches)
    }

    async fn append_record_log(&self, log: &ImportRecordLog) -> Result<()> {
        self.record_logs
            .lock()
            .map_err(|_| ImportError::Storage("record log lock poisoned".to_string()))?
            .push(log.clone());
        Ok(())
    }

    async fn record_logs_for_session(&self, session_id: &str) -> Result<Vec<ImportRecordLog>> {
        let logs = self
            .record_logs
            .lock()
            .map_err(|_| ImportError::Storage("record log lock poisoned".to_string()))?;
        Ok(logs
            .iter()
            .filter(|l| l.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_entity(&self, _entity_type: &str, record: &Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.entities.insert(id.clone(), record.clone());
        Ok(id)
    }
}

/// Failed rows for a session, in row order, for retry targeting.
pub async fn failed_rows(
    storage: &dyn ImportStorage,
    session_id: &str,
) -> Result<Vec<ImportRecordLog>> {
    let mut failed: Vec<ImportRecordLog> = storage
        .record_logs_for_session(session_id)
        .await?
        .into_iter()
        .filter(|l| l.status == RecordStatus::Failed)
        .collect();
    failed.sort_by_key(|l| l.row_index);
    Ok(failed)
}
