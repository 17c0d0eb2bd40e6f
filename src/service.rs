//! Top-level composition root
//!
//! One `ImportService` per process, built once by whoever owns the runtime
//! (the demo binary, an HTTP server, a test). All shared state lives behind
//! the handles constructed here; nothing in the crate reaches for globals.

use crate::batch::{BatchLoader, FieldMapping, ImportSession, LifecycleEvent, LoaderOptions};
use crate::error::Result;
use crate::extraction::{ExtractionResult, ExtractorConfig};
use crate::inference::{FieldInferenceEngine, StructureReport};
use crate::ingest::{extract_dataset, FileKind};
use crate::learning_store::{LearningStore, MappingSuggestion};
use crate::progress::ProgressBroadcaster;
use crate::storage::ImportStorage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Everything an import pipeline needs, wired once.
pub struct ImportService {
    storage: Arc<dyn ImportStorage>,
    loader: BatchLoader,
    learning: LearningStore,
    broadcaster: Arc<ProgressBroadcaster>,
    extractor_config: ExtractorConfig,
    heartbeat: tokio::task::JoinHandle<()>,
}

/// Outcome of the analysis phase: what the file parsed into, what the
/// columns look like, and what mappings history suggests.
pub struct AnalysisReport {
    pub extraction: ExtractionResult,
    pub structure: StructureReport,
    pub suggestions: HashMap<String, Vec<MappingSuggestion>>,
}

impl ImportService {
    /// Wire the pipeline and start the subscriber heartbeat sweep. Must be
    /// called from within the tokio runtime.
    pub fn new(
        storage: Arc<dyn ImportStorage>,
        learning_dir: &Path,
        loader_options: LoaderOptions,
        extractor_config: ExtractorConfig,
    ) -> Result<Self> {
        let learning = LearningStore::new(learning_dir)?;
        let loader = BatchLoader::new(Arc::clone(&storage), loader_options);
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let heartbeat = tokio::spawn(crate::progress::heartbeat_loop(Arc::clone(&broadcaster)));
        Ok(Self {
            storage,
            loader,
            learning,
            broadcaster,
            extractor_config,
            heartbeat,
        })
    }

    /// Extract, infer structure, and gather mapping suggestions for a raw
    /// upload. Side-effect free: nothing is persisted until a run starts.
    pub async fn analyze(
        &self,
        buffer: &[u8],
        kind_hint: Option<FileKind>,
        filename: &str,
    ) -> Result<AnalysisReport> {
        let extraction =
            extract_dataset(buffer, kind_hint, filename, &self.extractor_config).await?;
        let engine = FieldInferenceEngine::new();
        let structure = engine.analyze(&extraction);

        let mut suggestions = HashMap::new();
        for field in &structure.fields {
            let found = self.learning.suggest(&field.name)?;
            if !found.is_empty() {
                suggestions.insert(field.name.clone(), found);
            }
        }
        info!(
            strategy = %extraction.strategy,
            fields = structure.fields.len(),
            suggested = suggestions.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            extraction,
            structure,
            suggestions,
        })
    }

    /// Record a confirmed mapping so future imports of similar files get
    /// better suggestions.
    pub fn confirm_mapping(
        &self,
        mapping: &[FieldMapping],
        confidence: f64,
        strategy: &str,
    ) -> Result<()> {
        for m in mapping {
            self.learning
                .record_mapping(&m.source_field, &m.target_field, confidence, Some(strategy))?;
        }
        Ok(())
    }

    /// Run an import session to completion, streaming lifecycle events to
    /// the session's subscribers.
    pub async fn run_import(
        &self,
        session_id: &str,
        entity_type: &str,
        records: Vec<serde_json::Value>,
        mapping: Vec<FieldMapping>,
    ) -> Result<ImportSession> {
        let (tx, rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let pump = tokio::spawn(crate::progress::pump(Arc::clone(&self.broadcaster), rx));

        let result = self
            .loader
            .run(session_id, entity_type, records, mapping, tx)
            .await;

        // Closing the sender (dropped above inside run) ends the pump.
        let _ = pump.await;
        result
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.loader.cancel(session_id).await
    }

    pub async fn retry_failed(&self, session_id: &str) -> Result<ImportSession> {
        let (tx, rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let pump = tokio::spawn(crate::progress::pump(Arc::clone(&self.broadcaster), rx));
        let result = self.loader.retry_failed(session_id, tx).await;
        let _ = pump.await;
        result
    }

    pub fn storage(&self) -> &Arc<dyn ImportStorage> {
        &self.storage
    }

    pub fn loader(&self) -> &BatchLoader {
        &self.loader
    }

    pub fn learning(&self) -> &LearningStore {
        &self.learning
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }
}

impl Drop for ImportService {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_analyze_then_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let service = ImportService::new(
            storage.clone(),
            dir.path(),
            LoaderOptions::default(),
            ExtractorConfig::default(),
        )
        .unwrap();

        let csv = b"Product Name,Unit Price\nWidget,9.99\nGadget,19.99\n";
        let report = service.analyze(csv, None, "products.csv").await.unwrap();
        assert_eq!(report.extraction.records.len(), 2);
        assert_eq!(report.structure.fields.len(), 2);

        let mapping = vec![
            FieldMapping::new("Product Name", "name"),
            FieldMapping::new("Unit Price", "price"),
        ];
        let session = service
            .run_import("s1", "product", report.extraction.records.clone(), mapping.clone())
            .await
            .unwrap();
        assert_eq!(session.successful_records, 2);
        assert_eq!(storage.entity_count(), 2);

        // Confirming the mapping makes it available to the next analysis.
        service
            .confirm_mapping(&mapping, 0.9, &report.extraction.strategy)
            .unwrap();
        let next = service.analyze(csv, None, "products.csv").await.unwrap();
        let suggested = next.suggestions.get("Product Name").unwrap();
        assert_eq!(suggested[0].target_field, "name");
    }
}
