//! In-memory [`WarehouseClient`] used by unit and integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ColumnMode, ColumnSpec, InsertFailure, InsertRow, SchemaAlteration, WarehouseClient,
    WarehouseConfig,
};
use crate::models::{IngestionError, Result};

#[derive(Default)]
struct TableState {
    schema: Vec<ColumnSpec>,
    rows: Vec<InsertRow>,
}

pub struct MemoryWarehouse {
    config: WarehouseConfig,
    tables: Mutex<HashMap<String, TableState>>,
    fail_next_insert: Mutex<Option<String>>,
    poisoned: Mutex<bool>,
    buffer_ages: Mutex<HashMap<String, Duration>>,
    dml_log: Mutex<Vec<String>>,
    dml_deleted: Mutex<u64>,
}

impl MemoryWarehouse {
    pub fn new(config: WarehouseConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(HashMap::new()),
            fail_next_insert: Mutex::new(None),
            poisoned: Mutex::new(false),
            buffer_ages: Mutex::new(HashMap::new()),
            dml_log: Mutex::new(Vec::new()),
            dml_deleted: Mutex::new(0),
        }
    }

    /// Next insert call reports every row as failed with `message`.
    pub fn fail_next_insert_with(&self, message: &str) {
        *self.fail_next_insert.lock().unwrap() = Some(message.to_string());
    }

    /// Every subsequent insert call errors out entirely.
    pub fn poison_inserts(&self) {
        *self.poisoned.lock().unwrap() = true;
    }

    pub fn set_buffer_age(&self, table_id: &str, age: Duration) {
        self.buffer_ages.lock().unwrap().insert(table_id.to_string(), age);
    }

    pub fn clear_buffer(&self, table_id: &str) {
        self.buffer_ages.lock().unwrap().remove(table_id);
    }

    pub fn set_dml_deleted(&self, deleted: u64) {
        *self.dml_deleted.lock().unwrap() = deleted;
    }

    pub fn dml_statements(&self) -> Vec<String> {
        self.dml_log.lock().unwrap().clone()
    }

    pub fn row_count(&self, table_id: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table_id)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn rows(&self, table_id: &str) -> Vec<serde_json::Map<String, Value>> {
        self.tables
            .lock()
            .unwrap()
            .get(table_id)
            .map(|t| t.rows.iter().map(|r| r.json.clone()).collect())
            .unwrap_or_default()
    }

    pub fn table_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    async fn ensure_dataset(&self) -> Result<()> {
        Ok(())
    }

    async fn table_schema(&self, table_id: &str) -> Result<Option<Vec<ColumnSpec>>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table_id)
            .map(|t| t.schema.clone()))
    }

    async fn create_table(&self, table_id: &str, columns: &[ColumnSpec]) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .entry(table_id.to_string())
            .or_insert_with(|| TableState { schema: columns.to_vec(), rows: Vec::new() });
        Ok(())
    }

    async fn apply_alterations(
        &self,
        table_id: &str,
        alterations: &[SchemaAlteration],
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| IngestionError::TableNotFound(table_id.to_string()))?;
        for alteration in alterations {
            match alteration {
                SchemaAlteration::AddColumn(spec) => table.schema.push(spec.clone()),
                SchemaAlteration::RelaxToNullable { column } => {
                    if let Some(col) = table.schema.iter_mut().find(|c| &c.name == column) {
                        col.mode = ColumnMode::Nullable;
                    }
                }
                SchemaAlteration::WidenType { column, to, .. } => {
                    if let Some(col) = table.schema.iter_mut().find(|c| &c.name == column) {
                        col.column_type = *to;
                    }
                }
            }
        }
        Ok(())
    }

    async fn insert_rows(&self, table_id: &str, rows: &[InsertRow]) -> Result<Vec<InsertFailure>> {
        if *self.poisoned.lock().unwrap() {
            return Err(IngestionError::Warehouse("synthetic insert failure".into()));
        }
        if let Some(message) = self.fail_next_insert.lock().unwrap().take() {
            return Ok(rows
                .iter()
                .enumerate()
                .map(|(index, _)| InsertFailure { index, message: message.clone() })
                .collect());
        }
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| IngestionError::TableNotFound(table_id.to_string()))?;
        for row in rows {
            // Same insert id means the same logical row: redelivery is a no-op.
            if !table.rows.iter().any(|r| r.insert_id == row.insert_id) {
                table.rows.push(row.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn streaming_buffer_age(&self, table_id: &str) -> Result<Option<Duration>> {
        Ok(self.buffer_ages.lock().unwrap().get(table_id).copied())
    }

    async fn run_dml(&self, sql: &str) -> Result<u64> {
        self.dml_log.lock().unwrap().push(sql.to_string());
        Ok(*self.dml_deleted.lock().unwrap())
    }
}
