//! Run-state persistence: per-form configurations, run reports, and the
//! append-only field dictionary. The pipeline reads a configuration once at
//! run start and writes it once at run end; everything else here is audit.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{FieldDictionaryEntry, IngestionError, Result, RunConfig, RunReport};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read_config(&self, scope: &str) -> Result<Option<RunConfig>>;
    async fn write_config(&self, config: &RunConfig) -> Result<()>;
    async fn list_configs(&self) -> Result<Vec<RunConfig>>;
    async fn append_dictionary(&self, entries: &[FieldDictionaryEntry]) -> Result<()>;
    async fn record_run(&self, report: &RunReport) -> Result<()>;
    async fn recent_runs(&self, scope: &str, limit: i64) -> Result<Vec<RunReport>>;
}

#[derive(Clone)]
pub struct MongoStateStore {
    db: Database,
}

impl MongoStateStore {
    pub fn with_db(db: Database) -> Self {
        Self { db }
    }

    fn configs(&self) -> Collection<RunConfig> {
        self.db.collection("run_configs")
    }

    fn reports(&self) -> Collection<RunReport> {
        self.db.collection("run_reports")
    }

    fn dictionary(&self) -> Collection<FieldDictionaryEntry> {
        self.db.collection("field_dictionary")
    }
}

#[async_trait]
impl ConfigStore for MongoStateStore {
    async fn read_config(&self, scope: &str) -> Result<Option<RunConfig>> {
        self.configs()
            .find_one(doc! { "scope": scope }, None)
            .await
            .map_err(Into::into)
    }

    async fn write_config(&self, config: &RunConfig) -> Result<()> {
        let options = mongodb::options::ReplaceOptions::builder()
            .upsert(true)
            .build();
        self.configs()
            .replace_one(doc! { "scope": &config.scope }, config, options)
            .await?;
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<RunConfig>> {
        let mut cursor = self.configs().find(None, None).await?;
        let mut configs = Vec::new();
        while let Some(config) = cursor.next().await {
            configs.push(config?);
        }
        Ok(configs)
    }

    async fn append_dictionary(&self, entries: &[FieldDictionaryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // Append-only: duplicates across runs are acceptable, the collection
        // is read by humans, never by the pipeline.
        self.dictionary().insert_many(entries, None).await?;
        Ok(())
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        self.reports().insert_one(report, None).await?;
        Ok(())
    }

    async fn recent_runs(&self, scope: &str, limit: i64) -> Result<Vec<RunReport>> {
        let options = mongodb::options::FindOptions::builder()
            .sort(doc! { "started_at": -1 })
            .limit(limit)
            .build();
        let mut cursor = self
            .reports()
            .find(doc! { "scope": scope }, options)
            .await?;
        let mut reports = Vec::new();
        while let Some(report) = cursor.next().await {
            reports.push(report?);
        }
        Ok(reports)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<HashMap<String, RunConfig>>,
    dictionary: Mutex<Vec<FieldDictionaryEntry>>,
    reports: Mutex<Vec<RunReport>>,
    fail_writes: Mutex<bool>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RunConfig) -> Self {
        let store = Self::default();
        store
            .configs
            .lock()
            .unwrap()
            .insert(config.scope.clone(), config);
        store
    }

    pub fn fail_config_writes(&self) {
        *self.fail_writes.lock().unwrap() = true;
    }

    pub fn dictionary_entries(&self) -> Vec<FieldDictionaryEntry> {
        self.dictionary.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn read_config(&self, scope: &str) -> Result<Option<RunConfig>> {
        Ok(self.configs.lock().unwrap().get(scope).cloned())
    }

    async fn write_config(&self, config: &RunConfig) -> Result<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(IngestionError::Sync("config store unavailable".into()));
        }
        self.configs
            .lock()
            .unwrap()
            .insert(config.scope.clone(), config.clone());
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<RunConfig>> {
        Ok(self.configs.lock().unwrap().values().cloned().collect())
    }

    async fn append_dictionary(&self, entries: &[FieldDictionaryEntry]) -> Result<()> {
        self.dictionary.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn recent_runs(&self, scope: &str, limit: i64) -> Result<Vec<RunReport>> {
        let mut reports: Vec<RunReport> = self
            .reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect();
        reports.reverse();
        reports.truncate(limit.max(0) as usize);
        Ok(reports)
    }
}
