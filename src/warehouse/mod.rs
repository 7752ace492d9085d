//! Warehouse write protocol: idempotent table/column reconciliation and
//! at-least-once row insertion.
//!
//! The raw table/dataset operations live behind [`WarehouseClient`]; the
//! [`WarehouseGateway`] implements the parts with actual behavior: schema
//! evolution on write, type widening with same-call value coercion, bounded
//! retry on not-found, and the deduplication batch job (see [`dedup`]).

pub mod bigquery;
pub mod dedup;
pub mod testing;

pub use dedup::{DedupReport, DedupWaitOptions, TableDedup};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{IngestionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Bool,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Int64 => "INT64",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::Bool => "BOOL",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::DateTime => "DATETIME",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnMode {
    Nullable,
    Required,
    Repeated,
}

impl ColumnMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnMode::Nullable => "NULLABLE",
            ColumnMode::Required => "REQUIRED",
            ColumnMode::Repeated => "REPEATED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub mode: ColumnMode,
}

impl ColumnSpec {
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, mode: ColumnMode::Nullable }
    }

    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, mode: ColumnMode::Required }
    }

    pub fn repeated(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, mode: ColumnMode::Repeated }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub location: Option<String>,
}

impl WarehouseConfig {
    pub fn table_ref(&self, table_id: &str) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, table_id)
    }
}

/// Schema changes the gateway may request against an existing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaAlteration {
    AddColumn(ColumnSpec),
    RelaxToNullable { column: String },
    WidenType { column: String, to: ColumnType, repeated: bool },
}

/// One row handed to the streaming insert API. The insert id is the
/// deterministic idempotency key; redelivery of the same logical row is safe.
#[derive(Debug, Clone)]
pub struct InsertRow {
    pub insert_id: String,
    pub json: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct InsertFailure {
    pub index: usize,
    pub message: String,
}

/// Raw warehouse operations, vendor-shaped and free of pipeline logic.
/// Implemented over the BigQuery REST API in production ([`bigquery`]) and
/// in memory for tests.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    fn config(&self) -> &WarehouseConfig;
    async fn ensure_dataset(&self) -> Result<()>;
    /// `None` when the table does not exist.
    async fn table_schema(&self, table_id: &str) -> Result<Option<Vec<ColumnSpec>>>;
    async fn create_table(&self, table_id: &str, columns: &[ColumnSpec]) -> Result<()>;
    async fn apply_alterations(&self, table_id: &str, alterations: &[SchemaAlteration]) -> Result<()>;
    async fn insert_rows(&self, table_id: &str, rows: &[InsertRow]) -> Result<Vec<InsertFailure>>;
    /// Age of the oldest entry in the table's streaming buffer; `None` when
    /// the buffer is empty.
    async fn streaming_buffer_age(&self, table_id: &str) -> Result<Option<std::time::Duration>>;
    /// Runs a DML statement, returning the number of affected rows.
    async fn run_dml(&self, sql: &str) -> Result<u64>;
}

/// Result of reconciling incoming columns against a live table schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaReconciliation {
    pub added: Vec<String>,
    pub converted_to_string: Vec<String>,
    pub dropped_not_null: Vec<String>,
    pub altered: Vec<String>,
    /// Subset of `converted_to_string` whose stored column stays REPEATED
    /// (ARRAY<STRING>): values keep their array shape, elements stringify.
    pub kept_repeated: Vec<String>,
}

impl SchemaReconciliation {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.altered.is_empty() && self.dropped_not_null.is_empty()
    }
}

pub const DEFAULT_INSERT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct WarehouseGateway {
    client: Arc<dyn WarehouseClient>,
    max_insert_attempts: u32,
}

impl WarehouseGateway {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self { client, max_insert_attempts: DEFAULT_INSERT_ATTEMPTS }
    }

    pub fn with_max_insert_attempts(mut self, attempts: u32) -> Self {
        self.max_insert_attempts = attempts.max(1);
        self
    }

    pub fn config(&self) -> &WarehouseConfig {
        self.client.config()
    }

    pub fn client(&self) -> &Arc<dyn WarehouseClient> {
        &self.client
    }

    pub async fn ensure_dataset(&self) -> Result<()> {
        self.client.ensure_dataset().await
    }

    /// Creates the table with the given columns when absent. Safe to call on
    /// every run; existing tables are left untouched.
    pub async fn ensure_table(&self, table_id: &str, columns: &[ColumnSpec]) -> Result<()> {
        if self.client.table_schema(table_id).await?.is_none() {
            tracing::info!(table_id = %table_id, column_count = columns.len(), "Creating warehouse table");
            self.client.create_table(table_id, columns).await?;
        }
        Ok(())
    }

    /// Reconciles `incoming` against the live schema: adds missing columns,
    /// relaxes REQUIRED before widening, widens conflicting types to STRING
    /// and INT64 to FLOAT64. Values for columns listed in
    /// `converted_to_string` must be coerced with [`coerce_rows`] before the
    /// insert that follows.
    pub async fn ensure_columns(
        &self,
        table_id: &str,
        incoming: &[ColumnSpec],
    ) -> Result<SchemaReconciliation> {
        let existing = self
            .client
            .table_schema(table_id)
            .await?
            .ok_or_else(|| IngestionError::TableNotFound(table_id.to_string()))?;
        let by_name: HashMap<&str, &ColumnSpec> =
            existing.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut alterations = Vec::new();
        let mut outcome = SchemaReconciliation::default();

        for col in incoming {
            let Some(current) = by_name.get(col.name.as_str()) else {
                alterations.push(SchemaAlteration::AddColumn(col.clone()));
                outcome.added.push(col.name.clone());
                continue;
            };

            if current.column_type == col.column_type && current.mode == col.mode {
                continue;
            }
            // INT64 values always fit an existing FLOAT64 column.
            if current.column_type == ColumnType::Float64
                && col.column_type == ColumnType::Int64
                && current.mode == col.mode
            {
                continue;
            }
            // Numeric widening of the stored column.
            if current.column_type == ColumnType::Int64
                && col.column_type == ColumnType::Float64
                && current.mode == col.mode
            {
                alterations.push(SchemaAlteration::WidenType {
                    column: col.name.clone(),
                    to: ColumnType::Float64,
                    repeated: current.mode == ColumnMode::Repeated,
                });
                outcome.altered.push(col.name.clone());
                continue;
            }

            // Every other conflict resolves by widening the stored column to
            // STRING (ARRAY<STRING> keeps its REPEATED mode). REQUIRED must be
            // relaxed first or the ALTER is rejected.
            if current.mode == ColumnMode::Required {
                alterations.push(SchemaAlteration::RelaxToNullable { column: col.name.clone() });
                outcome.dropped_not_null.push(col.name.clone());
            }
            if current.column_type != ColumnType::String {
                alterations.push(SchemaAlteration::WidenType {
                    column: col.name.clone(),
                    to: ColumnType::String,
                    repeated: current.mode == ColumnMode::Repeated,
                });
                outcome.altered.push(col.name.clone());
            }
            if current.mode == ColumnMode::Repeated {
                outcome.kept_repeated.push(col.name.clone());
            }
            outcome.converted_to_string.push(col.name.clone());
        }

        if !alterations.is_empty() {
            tracing::info!(
                table_id = %table_id,
                added = outcome.added.len(),
                widened = outcome.altered.len(),
                relaxed = outcome.dropped_not_null.len(),
                "Reconciling table schema"
            );
            self.client.apply_alterations(table_id, &alterations).await?;
        }

        Ok(outcome)
    }

    /// Inserts with bounded retry on a not-found-class failure: the dataset
    /// and table are re-ensured between attempts, anything else propagates.
    pub async fn insert_all(
        &self,
        table_id: &str,
        rows: &[InsertRow],
        schema: &[ColumnSpec],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut attempt: u32 = 1;
        loop {
            match self.client.insert_rows(table_id, rows).await {
                Ok(failures) if failures.is_empty() => {
                    tracing::debug!(table_id = %table_id, rows = rows.len(), "Insert ok");
                    return Ok(());
                }
                Ok(failures) => {
                    let sample = failures
                        .first()
                        .map(|f| f.message.clone())
                        .unwrap_or_default();
                    return Err(IngestionError::InsertRejected {
                        table_id: table_id.to_string(),
                        failed: failures.len(),
                        sample,
                    });
                }
                Err(IngestionError::TableNotFound(_)) if attempt < self.max_insert_attempts => {
                    tracing::warn!(
                        table_id = %table_id,
                        attempt = attempt,
                        "Insert hit missing table; re-ensuring and retrying"
                    );
                    self.client.ensure_dataset().await?;
                    self.ensure_table(table_id, schema).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deterministic idempotency key for one logical row.
    pub fn insert_id(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        format!("{:x}", hasher.finalize())[..32].to_string()
    }
}

/// Stringifies a value the way a STRING-widened column expects it: arrays
/// comma-joined, objects JSON-encoded, scalars rendered plainly.
pub fn coerce_value_to_string(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(_) => value.clone(),
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(render_scalar)
                .collect::<Vec<_>>()
                .join(",");
            Value::String(joined)
        }
        Value::Object(_) => Value::String(serde_json::to_string(value).unwrap_or_default()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Applies [`coerce_value_to_string`] in-place to every row value whose
/// column was widened to STRING during the current reconciliation. A column
/// that stays REPEATED keeps its array shape with stringified elements.
pub fn coerce_rows(rows: &mut [Map<String, Value>], reconciliation: &SchemaReconciliation) {
    if reconciliation.converted_to_string.is_empty() {
        return;
    }
    let repeated: std::collections::HashSet<&str> = reconciliation
        .kept_repeated
        .iter()
        .map(String::as_str)
        .collect();

    for row in rows.iter_mut() {
        for column in &reconciliation.converted_to_string {
            let Some(value) = row.get_mut(column) else { continue };
            if repeated.contains(column.as_str()) {
                if let Value::Array(items) = value {
                    let coerced: Vec<Value> = items
                        .iter()
                        .map(|v| Value::String(render_scalar(v)))
                        .collect();
                    *value = Value::Array(coerced);
                    continue;
                }
            }
            *value = coerce_value_to_string(value);
        }
    }
}

/// Base columns of the raw-JSON landing table.
pub fn raw_table_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::required("form_id", ColumnType::String),
        ColumnSpec::required("entry_id", ColumnType::String),
        ColumnSpec::nullable("update_time", ColumnType::Timestamp),
        ColumnSpec::nullable("payload", ColumnType::String),
        ColumnSpec::nullable("inserted_at", ColumnType::Timestamp),
    ]
}

/// Base columns every flattened parent table starts with; dynamic field
/// columns are reconciled on top of these.
pub fn parent_base_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::required("entry_id", ColumnType::String),
        ColumnSpec::required("form_id", ColumnType::String),
        ColumnSpec::nullable("form_unique_id", ColumnType::String),
        ColumnSpec::nullable("user_id", ColumnType::String),
        ColumnSpec::nullable("user_name", ColumnType::String),
        ColumnSpec::nullable("origin", ColumnType::String),
        ColumnSpec::nullable("answer_time", ColumnType::Timestamp),
        ColumnSpec::nullable("answer_time_cet", ColumnType::DateTime),
        ColumnSpec::nullable("update_time", ColumnType::Timestamp),
        ColumnSpec::nullable("update_time_cet", ColumnType::DateTime),
        ColumnSpec::nullable("inserted_at", ColumnType::Timestamp),
    ]
}

/// Tag columns every repeating-group sub-table starts with.
pub fn sub_table_base_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::required("parent_entry_id", ColumnType::String),
        ColumnSpec::nullable("parent_form_unique_id", ColumnType::String),
        ColumnSpec::required("sub_row_index", ColumnType::Int64),
        ColumnSpec::nullable("parent_answer_time", ColumnType::Timestamp),
        ColumnSpec::nullable("parent_update_time", ColumnType::Timestamp),
        ColumnSpec::nullable("inserted_at", ColumnType::Timestamp),
    ]
}

pub fn media_table_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::required("form_id", ColumnType::String),
        ColumnSpec::required("entry_id", ColumnType::String),
        ColumnSpec::nullable("field_slug", ColumnType::String),
        ColumnSpec::required("file_id", ColumnType::String),
        ColumnSpec::nullable("file_name", ColumnType::String),
        ColumnSpec::nullable("storage_url", ColumnType::String),
        ColumnSpec::nullable("public_url", ColumnType::String),
        ColumnSpec::nullable("inserted_at", ColumnType::Timestamp),
    ]
}
