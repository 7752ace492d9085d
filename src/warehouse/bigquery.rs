//! Thin REST wrapper implementing [`WarehouseClient`] against the BigQuery
//! v2 API. No pipeline logic lives here; schema reconciliation and retry
//! policy are the gateway's job. Authentication uses a pre-issued bearer
//! token from configuration; token refresh is out of scope.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    ColumnMode, ColumnSpec, ColumnType, InsertFailure, InsertRow, SchemaAlteration,
    WarehouseClient, WarehouseConfig,
};
use crate::models::{IngestionError, Result};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

pub struct BigQueryClient {
    http: Client,
    base_url: String,
    token: String,
    config: WarehouseConfig,
}

impl BigQueryClient {
    pub fn new(config: WarehouseConfig, token: String, timeout_ms: u64, user_agent: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(user_agent)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
            config,
        }
    }

    /// Point the client at an emulator or stub server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets",
            self.base_url, self.config.project_id
        )
    }

    fn table_url(&self, table_id: &str) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base_url, self.config.project_id, self.config.dataset_id, table_id
        )
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(IngestionError::Warehouse(format!(
                    "GET {url} failed: status={status} body={body}"
                )))
            }
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(IngestionError::TableNotFound(url.to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IngestionError::Warehouse(format!(
                "POST {url} failed: status={status} body={text}"
            )));
        }
        Ok(response.json().await?)
    }

    fn schema_json(columns: &[ColumnSpec]) -> Value {
        let fields: Vec<Value> = columns
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "type": type_name(c.column_type),
                    "mode": c.mode.as_sql(),
                })
            })
            .collect();
        json!({ "fields": fields })
    }
}

fn type_name(t: ColumnType) -> &'static str {
    // The tables API reports legacy names for some types.
    match t {
        ColumnType::String => "STRING",
        ColumnType::Int64 => "INTEGER",
        ColumnType::Float64 => "FLOAT",
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::Time => "TIME",
        ColumnType::DateTime => "DATETIME",
        ColumnType::Timestamp => "TIMESTAMP",
    }
}

fn parse_type(name: &str) -> ColumnType {
    match name {
        "INTEGER" | "INT64" => ColumnType::Int64,
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => ColumnType::Float64,
        "BOOLEAN" | "BOOL" => ColumnType::Bool,
        "DATE" => ColumnType::Date,
        "TIME" => ColumnType::Time,
        "DATETIME" => ColumnType::DateTime,
        "TIMESTAMP" => ColumnType::Timestamp,
        _ => ColumnType::String,
    }
}

fn parse_mode(name: &str) -> ColumnMode {
    match name {
        "REQUIRED" => ColumnMode::Required,
        "REPEATED" => ColumnMode::Repeated,
        _ => ColumnMode::Nullable,
    }
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    async fn ensure_dataset(&self) -> Result<()> {
        let url = format!("{}/{}", self.dataset_url(), self.config.dataset_id);
        if self.get_json(&url).await?.is_some() {
            return Ok(());
        }
        let mut body = json!({
            "datasetReference": {
                "projectId": self.config.project_id,
                "datasetId": self.config.dataset_id,
            }
        });
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        tracing::info!(dataset = %self.config.dataset_id, "Creating dataset");
        self.post_json(&self.dataset_url(), &body).await.map(|_| ())
    }

    async fn table_schema(&self, table_id: &str) -> Result<Option<Vec<ColumnSpec>>> {
        let Some(table) = self.get_json(&self.table_url(table_id)).await? else {
            return Ok(None);
        };
        let fields = table
            .pointer("/schema/fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let columns = fields
            .iter()
            .filter_map(|f| {
                Some(ColumnSpec {
                    name: f.get("name")?.as_str()?.to_string(),
                    column_type: parse_type(f.get("type").and_then(Value::as_str).unwrap_or("")),
                    mode: parse_mode(f.get("mode").and_then(Value::as_str).unwrap_or("NULLABLE")),
                })
            })
            .collect();
        Ok(Some(columns))
    }

    async fn create_table(&self, table_id: &str, columns: &[ColumnSpec]) -> Result<()> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base_url, self.config.project_id, self.config.dataset_id
        );
        let body = json!({
            "tableReference": {
                "projectId": self.config.project_id,
                "datasetId": self.config.dataset_id,
                "tableId": table_id,
            },
            "schema": Self::schema_json(columns),
        });
        match self.post_json(&url, &body).await {
            Ok(_) => Ok(()),
            // Lost the creation race to a concurrent run; the table is there.
            Err(IngestionError::Warehouse(msg)) if msg.contains("409") || msg.contains("duplicate") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_alterations(
        &self,
        table_id: &str,
        alterations: &[SchemaAlteration],
    ) -> Result<()> {
        let table_ref = self.config.table_ref(table_id);
        for alteration in alterations {
            let sql = match alteration {
                SchemaAlteration::AddColumn(spec) => {
                    let ty = if spec.mode == ColumnMode::Repeated {
                        format!("ARRAY<{}>", spec.column_type.as_sql())
                    } else {
                        spec.column_type.as_sql().to_string()
                    };
                    format!(
                        "ALTER TABLE `{table_ref}` ADD COLUMN IF NOT EXISTS `{}` {ty}",
                        spec.name
                    )
                }
                SchemaAlteration::RelaxToNullable { column } => {
                    format!("ALTER TABLE `{table_ref}` ALTER COLUMN `{column}` DROP NOT NULL")
                }
                SchemaAlteration::WidenType { column, to, repeated } => {
                    let ty = if *repeated {
                        format!("ARRAY<{}>", to.as_sql())
                    } else {
                        to.as_sql().to_string()
                    };
                    format!("ALTER TABLE `{table_ref}` ALTER COLUMN `{column}` SET DATA TYPE {ty}")
                }
            };
            self.run_dml(&sql).await?;
        }
        Ok(())
    }

    async fn insert_rows(&self, table_id: &str, rows: &[InsertRow]) -> Result<Vec<InsertFailure>> {
        let url = format!("{}/insertAll", self.table_url(table_id));
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "rows": rows
                .iter()
                .map(|r| json!({"insertId": r.insert_id, "json": r.json}))
                .collect::<Vec<_>>(),
        });
        let response = self.post_json(&url, &body).await.map_err(|e| match e {
            IngestionError::TableNotFound(_) => IngestionError::TableNotFound(table_id.to_string()),
            other => other,
        })?;

        let failures = response
            .get("insertErrors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .map(|e| InsertFailure {
                        index: e.get("index").and_then(Value::as_u64).unwrap_or(0) as usize,
                        message: e
                            .pointer("/errors/0/message")
                            .and_then(Value::as_str)
                            .unwrap_or("insert error")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(failures)
    }

    async fn streaming_buffer_age(&self, table_id: &str) -> Result<Option<Duration>> {
        let Some(table) = self.get_json(&self.table_url(table_id)).await? else {
            return Ok(None);
        };
        let oldest_ms = table
            .pointer("/streamingBuffer/oldestEntryTime")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            });
        Ok(oldest_ms.map(|ms| {
            let age_ms = (chrono::Utc::now().timestamp_millis() - ms).max(0) as u64;
            Duration::from_millis(age_ms)
        }))
    }

    async fn run_dml(&self, sql: &str) -> Result<u64> {
        let url = format!("{}/projects/{}/queries", self.base_url, self.config.project_id);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
        });
        let response = self.post_json(&url, &body).await?;
        if let Some(errors) = response.get("errors").filter(|e| !e.is_null()) {
            return Err(IngestionError::Warehouse(format!(
                "Query failed: {errors}"
            )));
        }
        Ok(response
            .get("numDmlAffectedRows")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<u64>().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .unwrap_or(0))
    }
}
