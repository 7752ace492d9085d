use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MetadataStatus, RunStatus};
use crate::warehouse::DedupReport;

/// Audit document for one pipeline run, persisted to `run_reports`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub run_id: String,
    pub scope: String,
    pub form_id: String,
    pub action: String,
    pub started_at: BsonDateTime,
    pub completed_at: Option<BsonDateTime>,
    pub status: RunStatus,
    pub row_count: i64,
    pub duration_s: Option<f64>,
    pub metadata_status: Option<MetadataStatus>,
    pub error: Option<String>,
    pub dedup: Option<DedupReport>,
}

impl RunReport {
    pub fn started(scope: &str, form_id: &str, action: &str) -> Self {
        Self {
            id: None,
            run_id: format!("run_{}", Uuid::new_v4().simple()),
            scope: scope.to_string(),
            form_id: form_id.to_string(),
            action: action.to_string(),
            started_at: BsonDateTime::now(),
            completed_at: None,
            status: RunStatus::Error,
            row_count: 0,
            duration_s: None,
            metadata_status: None,
            error: None,
            dedup: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, row_count: i64) {
        self.status = status;
        self.row_count = row_count;
        let now = BsonDateTime::now();
        self.completed_at = Some(now);
        let elapsed_ms = now.timestamp_millis() - self.started_at.timestamp_millis();
        self.duration_s = Some(elapsed_ms as f64 / 1000.0);
    }
}

/// What `IngestionEngine::run` hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub row_count: usize,
    pub latest_entry_id: Option<String>,
    pub metadata_status: MetadataStatus,
}

/// Append-only audit of every column ever materialized in the warehouse.
/// Written for discoverability; the pipeline never reads it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDictionaryEntry {
    pub table_id: String,
    pub field_slug: String,
    pub label: String,
    pub column_type: String,
    pub mode: String,
    pub source_type: String,
    pub last_seen_at: String,
}

/// One media asset (photo/signature) discovered while flattening, keyed by
/// `(form_id, entry_id, file_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRow {
    pub form_id: String,
    pub entry_id: String,
    pub field_slug: String,
    pub file_id: String,
    pub file_name: String,
    pub storage_url: String,
    pub public_url: String,
}
