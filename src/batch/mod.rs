//! Batch Loading - sessions, batches, record logs and the concurrent loader
//!
//! One import attempt is a session; its dataset is partitioned into
//! fixed-size batches processed under bounded concurrency. Every source row
//! gets an audit-log entry so failed subsets can be retried precisely.

pub mod loader;
pub mod validation;

pub use loader::{BatchLoader, LoaderOptions, SessionMetrics};
pub use validation::{validate_record, ValidatedRecord, ValidationIssue};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One confirmed source-column -> target-field association
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_field: source.into(),
            target_field: target.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::CompletedWithErrors
                | SessionStatus::Failed
                | SessionStatus::Cancelled
        )
    }

    /// Status may only move forward; terminal states never regress.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            SessionStatus::Pending => matches!(
                next,
                SessionStatus::Processing | SessionStatus::Failed | SessionStatus::Cancelled
            ),
            SessionStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

/// One end-to-end import attempt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: String,
    pub entity_type: String,
    pub status: SessionStatus,

    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,

    pub records_per_second: f64,
    pub eta_seconds: Option<f64>,

    /// Original mapping, kept so failed rows can be retried as-is
    pub mapping: Vec<FieldMapping>,

    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSession {
    pub fn new(id: String, entity_type: String, total_records: usize, mapping: Vec<FieldMapping>) -> Self {
        let now = Utc::now();
        Self {
            id,
            entity_type,
            status: SessionStatus::Pending,
            total_records,
            processed_records: 0,
            successful_records: 0,
            failed_records: 0,
            records_per_second: 0.0,
            eta_seconds: None,
            mapping,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One fixed-size partition of a session's dataset
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportBatch {
    pub session_id: String,
    pub batch_number: usize,

    /// Row-index range [start_row, end_row) in the source dataset
    pub start_row: usize,
    pub end_row: usize,

    pub record_count: usize,
    pub status: BatchStatus,
    pub success_count: usize,
    pub failure_count: usize,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// Audit-trail entry: one source row, one attempt, one disposition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportRecordLog {
    pub session_id: String,
    pub batch_number: usize,
    pub row_index: usize,
    pub status: RecordStatus,

    /// Entity id produced on success
    pub entity_id: Option<String>,

    /// Validation errors / failure reasons
    pub errors: Vec<String>,

    /// Whether failures carried an auto-fix suggestion
    pub auto_fixable: bool,

    /// Original raw record, kept on failures so retries are self-contained
    pub source_record: Option<serde_json::Value>,
}

/// Lifecycle message emitted by the loader and consumed by the progress
/// broadcaster. Serialized with a `type` discriminator for subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Progress {
        session_id: String,
        processed: usize,
        successful: usize,
        failed: usize,
        total: usize,
        records_per_second: f64,
        eta_seconds: Option<f64>,
    },
    BatchCompleted {
        session_id: String,
        batch_number: usize,
        success_count: usize,
        failure_count: usize,
    },
    BatchFailed {
        session_id: String,
        batch_number: usize,
        error: String,
    },
    Completed {
        session_id: String,
        successful: usize,
        failed: usize,
    },
    CompletedWithErrors {
        session_id: String,
        successful: usize,
        failed: usize,
    },
    Error {
        session_id: String,
        message: String,
    },
    Cancelled {
        session_id: String,
    },
}

impl LifecycleEvent {
    pub fn session_id(&self) -> &str {
        match self {
            LifecycleEvent::Progress { session_id, .. }
            | LifecycleEvent::BatchCompleted { session_id, .. }
            | LifecycleEvent::BatchFailed { session_id, .. }
            | LifecycleEvent::Completed { session_id, .. }
            | LifecycleEvent::CompletedWithErrors { session_id, .. }
            | LifecycleEvent::Error { session_id, .. }
            | LifecycleEvent::Cancelled { session_id } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Processing));
        assert!(SessionStatus::Processing.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Processing.can_transition_to(SessionStatus::Cancelled));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Processing));
        assert!(!SessionStatus::Cancelled.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Processing.can_transition_to(SessionStatus::Pending));
    }

    #[test]
    fn test_lifecycle_event_wire_format() {
        let event = LifecycleEvent::BatchCompleted {
            session_id: "s1".to_string(),
            batch_number: 2,
            success_count: 98,
            failure_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "batch_completed");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["batch_number"], 2);
    }
}
