pub mod error;
pub mod extraction;
pub mod ingest;
pub mod inference;
pub mod learning_store;
pub mod batch;
pub mod storage;
pub mod progress;
pub mod service;

pub use error::{ImportError, Result};
pub use extraction::{AdaptiveExtractor, ExtractionResult, ExtractionMetadata, ExtractorConfig};
pub use ingest::{extract_dataset, sniff_file_kind, FileKind};
pub use inference::{FieldInferenceEngine, FieldDescriptor, FieldType, StructureReport};
pub use learning_store::{LearningStore, LearnedPattern, MappingSuggestion, LearningStats};
pub use batch::{
    BatchLoader, LoaderOptions, FieldMapping, ImportSession, ImportBatch, ImportRecordLog,
    SessionStatus, BatchStatus, LifecycleEvent,
};
pub use storage::{ImportStorage, MemoryStorage};
pub use progress::{ProgressBroadcaster, ClientMessage, ChannelHealth};
pub use service::ImportService;
