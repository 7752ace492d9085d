//! One pipeline run, end to end: resolve unread entries, fetch details,
//! flatten, write the warehouse targets, mark the source as read, reconcile
//! external lists, persist the run cursor.
//!
//! Failure policy: a bad record or field is logged and skipped; a rejected
//! batch or broken configuration aborts the run; the run lock is restored on
//! every path. Mark-as-read runs after the warehouse write, so a failed
//! chunk re-delivers its entries next run; the idempotent insert keys make
//! that harmless.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

use crate::clients::FormsApi;
use crate::lock::LockStore;
use crate::mapping::{compute_table_name, SchemaMapper};
use crate::media::MediaStore;
use crate::models::{
    ExceptionSink, FormEntry, IngestionError, MediaRow, MetadataStatus, Result, RunConfig,
    RunOutcome, RunReport, RunStatus, TracingExceptionSink,
};
use crate::storage::ConfigStore;
use crate::sync::lists::{self, LatestRowSnapshot, ListSyncOutcome};
use crate::sync::unread::{resolve_unread, UnreadOutcome};
use crate::warehouse::{
    coerce_rows, media_table_columns, parent_base_columns, raw_table_columns,
    sub_table_base_columns, ColumnSpec, DedupWaitOptions, InsertRow, WarehouseGateway,
};

/// All media assets share one table across forms.
pub const MEDIA_TABLE_ID: &str = "media_assets";

#[derive(Clone)]
pub struct EngineOptions {
    /// Ids per mark-as-read call.
    pub mark_read_chunk: usize,
    /// Concurrent detail fetches.
    pub fetch_parallelism: usize,
    pub dedup_enabled: bool,
    pub dedup_wait: DedupWaitOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mark_read_chunk: 50,
            fetch_parallelism: 4,
            dedup_enabled: true,
            dedup_wait: DedupWaitOptions::default(),
        }
    }
}

#[derive(Clone)]
pub struct IngestionEngine {
    forms: Arc<dyn FormsApi>,
    gateway: Option<WarehouseGateway>,
    store: Arc<dyn ConfigStore>,
    locks: Arc<dyn LockStore>,
    media: Option<Arc<dyn MediaStore>>,
    exceptions: Arc<dyn ExceptionSink>,
    timezone: Tz,
    options: EngineOptions,
}

struct LatestInfo {
    entry_id: String,
    update_time: Option<DateTime<Utc>>,
    answer_time: Option<DateTime<Utc>>,
}

struct BatchOutput {
    latest: Option<LatestInfo>,
    snapshot: LatestRowSnapshot,
    sub_table_ids: Vec<String>,
}

impl IngestionEngine {
    pub fn new(
        forms: Arc<dyn FormsApi>,
        store: Arc<dyn ConfigStore>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        Self {
            forms,
            gateway: None,
            store,
            locks,
            media: None,
            exceptions: Arc::new(TracingExceptionSink),
            timezone: chrono_tz::Europe::Paris,
            options: EngineOptions::default(),
        }
    }

    pub fn with_gateway(mut self, gateway: WarehouseGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaStore>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_exceptions(mut self, exceptions: Arc<dyn ExceptionSink>) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// One incremental pipeline run for `scope`.
    pub async fn run(&self, scope: &str) -> Result<RunOutcome> {
        let mut config = self.load_config(scope).await?;

        if !self.locks.try_acquire(scope).await? {
            tracing::info!(scope = %scope, "A run is already in progress; rejecting");
            return Err(IngestionError::RunInProgress(scope.to_string()));
        }
        tracing::info!(
            scope = %scope,
            form_id = %config.form_id,
            action = %config.action,
            "Starting ingestion run"
        );

        let mut report = RunReport::started(scope, &config.form_id, &config.action);
        let result = self.run_locked(&mut config, &mut report).await;
        self.release_lock(scope).await;
        self.finish(scope, &config, report, result).await
    }

    /// Historical re-ingestion from the full entry list, optionally filtered
    /// to an inclusive answer-time date range. No unread protocol, no
    /// mark-as-read, no list sync.
    pub async fn backfill(
        &self,
        scope: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<RunOutcome> {
        let mut config = self.load_config(scope).await?;

        if !self.locks.try_acquire(scope).await? {
            return Err(IngestionError::RunInProgress(scope.to_string()));
        }
        tracing::info!(
            scope = %scope,
            form_id = %config.form_id,
            from = ?from,
            to = ?to,
            "Starting backfill run"
        );

        let mut report = RunReport::started(scope, &config.form_id, &config.action);
        let result = self.backfill_locked(&mut config, &mut report, from, to).await;
        self.release_lock(scope).await;
        self.finish(scope, &config, report, result).await
    }

    async fn load_config(&self, scope: &str) -> Result<RunConfig> {
        let config = self
            .store
            .read_config(scope)
            .await?
            .ok_or_else(|| {
                IngestionError::Configuration(format!("No run configuration for '{scope}'"))
            })?;
        config.validate()?;
        if config.ingest_enabled && self.gateway.is_none() {
            return Err(IngestionError::Configuration(
                "Warehouse project/dataset not configured".to_string(),
            ));
        }
        Ok(config)
    }

    async fn release_lock(&self, scope: &str) {
        if let Err(e) = self.locks.release(scope).await {
            tracing::error!(scope = %scope, error = %e, "Failed to release run lock");
        }
    }

    async fn finish(
        &self,
        scope: &str,
        config: &RunConfig,
        mut report: RunReport,
        result: Result<RunOutcome>,
    ) -> Result<RunOutcome> {
        match result {
            Ok(outcome) => {
                report.metadata_status = Some(outcome.metadata_status.clone());
                report.finish(outcome.status, outcome.row_count as i64);
                if let Err(e) = self.store.record_run(&report).await {
                    tracing::warn!(scope = %scope, error = %e, "Failed to persist run report");
                }
                tracing::info!(
                    scope = %scope,
                    status = ?outcome.status,
                    rows = outcome.row_count,
                    "Run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                report.error = Some(e.to_string());
                report.finish(RunStatus::Error, 0);
                let _ = self.store.record_run(&report).await;
                self.exceptions.report(
                    scope,
                    &e,
                    json!({ "form_id": config.form_id, "action": config.action }),
                );
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        config: &mut RunConfig,
        report: &mut RunReport,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let resolution = resolve_unread(
            self.forms.as_ref(),
            &config.form_id,
            &config.action,
            config.batch_limit,
            config.has_previous_run(),
            None,
        )
        .await?;

        let candidates = match resolution {
            UnreadOutcome::Invalid(msg) => return Err(IngestionError::InvalidPayload(msg)),
            UnreadOutcome::NoUnread | UnreadOutcome::FallbackEmpty => {
                tracing::info!(form_id = %config.form_id, "Nothing to ingest");
                let _ = self
                    .persist_metadata(config, None, 0, started.elapsed().as_secs_f64())
                    .await;
                return Ok(RunOutcome {
                    status: RunStatus::NoData,
                    row_count: 0,
                    latest_entry_id: None,
                    metadata_status: MetadataStatus::Skipped,
                });
            }
            UnreadOutcome::Ok(candidates) | UnreadOutcome::FallbackOk(candidates) => candidates,
        };

        let entries = self
            .fetch_details(&config.form_id, candidates, config.batch_limit as usize)
            .await;
        if entries.is_empty() {
            tracing::warn!(form_id = %config.form_id, "Every candidate failed to fetch or decode");
            return Ok(RunOutcome {
                status: RunStatus::NoData,
                row_count: 0,
                latest_entry_id: None,
                metadata_status: MetadataStatus::Skipped,
            });
        }

        let table_id = table_id_for(config);
        let (batch, row_count) = self.flatten_and_write(config, &table_id, &entries).await?;

        let ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();
        self.mark_entries_read(config, &ids).await;

        let mut metadata_status = if config.sync_lists {
            self.sync_lists_if_drained(config, &batch.snapshot).await
        } else {
            MetadataStatus::Skipped
        };

        self.maybe_dedup(config, &table_id, &batch.sub_table_ids, report)
            .await;

        config.table_name = table_id;
        if let Err(e) = self
            .persist_metadata(
                config,
                batch.latest.as_ref(),
                row_count,
                started.elapsed().as_secs_f64(),
            )
            .await
        {
            tracing::warn!(scope = %config.scope, error = %e, "Failed to persist run metadata");
            metadata_status = MetadataStatus::Failed;
        }

        Ok(RunOutcome {
            status: RunStatus::Ingested,
            row_count,
            latest_entry_id: batch.latest.map(|l| l.entry_id),
            metadata_status,
        })
    }

    async fn backfill_locked(
        &self,
        config: &mut RunConfig,
        report: &mut RunReport,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let payload = self.forms.all_entries(&config.form_id).await?;
        let Some(all) = payload.get("data").and_then(Value::as_array) else {
            return Err(IngestionError::InvalidPayload(
                "full entry list has no data array".to_string(),
            ));
        };

        let filtered: Vec<Value> = all
            .iter()
            .filter(|summary| summary_in_range(summary, from, to))
            .cloned()
            .collect();
        tracing::info!(
            form_id = %config.form_id,
            total = all.len(),
            selected = filtered.len(),
            "Backfill candidate selection"
        );

        let entries = self
            .fetch_details(&config.form_id, filtered, usize::MAX)
            .await;
        if entries.is_empty() {
            return Ok(RunOutcome {
                status: RunStatus::NoData,
                row_count: 0,
                latest_entry_id: None,
                metadata_status: MetadataStatus::Skipped,
            });
        }

        let table_id = table_id_for(config);
        let (batch, row_count) = self.flatten_and_write(config, &table_id, &entries).await?;

        self.maybe_dedup(config, &table_id, &batch.sub_table_ids, report)
            .await;

        config.table_name = table_id;
        let _ = self
            .persist_metadata(
                config,
                batch.latest.as_ref(),
                row_count,
                started.elapsed().as_secs_f64(),
            )
            .await;

        Ok(RunOutcome {
            status: RunStatus::Ingested,
            row_count,
            latest_entry_id: batch.latest.map(|l| l.entry_id),
            metadata_status: MetadataStatus::Skipped,
        })
    }

    /// Fetches and decodes details with bounded parallelism. Candidates
    /// without a stable id, failed fetches and undecodable payloads are
    /// logged and dropped; the batch carries on.
    async fn fetch_details(
        &self,
        form_id: &str,
        candidates: Vec<Value>,
        limit: usize,
    ) -> Vec<FormEntry> {
        let mut ids = Vec::new();
        for summary in candidates.into_iter().take(limit) {
            match summary_id(&summary) {
                Some(id) => ids.push(id),
                None => {
                    tracing::warn!(form_id = %form_id, "Candidate without a stable id; skipping")
                }
            }
        }

        let forms = self.forms.clone();
        let form = form_id.to_string();
        stream::iter(ids)
            .map(|entry_id| {
                let forms = forms.clone();
                let form = form.clone();
                async move {
                    match forms.entry_detail(&form, &entry_id).await {
                        Ok(payload) => {
                            let decoded = FormEntry::from_detail(&form, &payload);
                            if decoded.is_none() {
                                tracing::warn!(
                                    form_id = %form,
                                    entry_id = %entry_id,
                                    "Detail payload undecodable; skipping"
                                );
                            }
                            decoded
                        }
                        Err(e) => {
                            tracing::warn!(
                                form_id = %form,
                                entry_id = %entry_id,
                                error = %e,
                                "Detail fetch failed; skipping"
                            );
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.options.fetch_parallelism.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Flattens the batch and writes every enabled warehouse target.
    async fn flatten_and_write(
        &self,
        config: &RunConfig,
        table_id: &str,
        entries: &[FormEntry],
    ) -> Result<(BatchOutput, usize)> {
        let mut mapper = SchemaMapper::new(self.timezone);
        let mut parent_rows: Vec<Map<String, Value>> = Vec::with_capacity(entries.len());
        let mut parent_columns: Vec<ColumnSpec> = Vec::new();
        let mut seen_columns: HashSet<String> = HashSet::new();
        let mut sub_batches: BTreeMap<String, (Vec<ColumnSpec>, Vec<Map<String, Value>>)> =
            BTreeMap::new();
        let mut media_rows: Vec<MediaRow> = Vec::new();
        let mut raw_rows: Vec<InsertRow> = Vec::new();

        for entry in entries {
            let mut prepared = mapper.prepare_parent_row(table_id, entry);

            if config.store_media {
                if let Some(media) = &self.media {
                    for candidate in &prepared.media {
                        match media
                            .process_field(
                                &entry.form_id,
                                &entry.entry_id,
                                &candidate.column,
                                &candidate.value,
                            )
                            .await
                        {
                            Ok(processed) if !processed.files.is_empty() => {
                                prepared.row.insert(
                                    candidate.column.clone(),
                                    Value::from(processed.formula.clone()),
                                );
                                for file in processed.files {
                                    media_rows.push(MediaRow {
                                        form_id: entry.form_id.clone(),
                                        entry_id: entry.entry_id.clone(),
                                        field_slug: candidate.column.clone(),
                                        file_id: file.file_id,
                                        file_name: file.file_name,
                                        storage_url: file.storage_url,
                                        public_url: file.public_url,
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(
                                entry_id = %entry.entry_id,
                                field = %candidate.column,
                                error = %e,
                                "Media field resolution failed; keeping raw value"
                            ),
                        }
                    }
                }
            }

            for column in &prepared.columns {
                if seen_columns.insert(column.name.clone()) {
                    parent_columns.push(column.clone());
                }
            }
            for subform in prepared.subforms {
                let (columns, rows) = sub_batches
                    .entry(subform.table_id.clone())
                    .or_insert_with(|| (Vec::new(), Vec::new()));
                for column in subform.columns {
                    if !columns.iter().any(|c| c.name == column.name) {
                        columns.push(column);
                    }
                }
                rows.extend(subform.rows);
            }

            let update_key = entry
                .update_time
                .map(format_utc)
                .unwrap_or_default();
            let mut raw_row = Map::new();
            raw_row.insert("form_id".into(), Value::from(entry.form_id.clone()));
            raw_row.insert("entry_id".into(), Value::from(entry.entry_id.clone()));
            raw_row.insert(
                "update_time".into(),
                entry.update_time.map(|t| Value::from(format_utc(t))).unwrap_or(Value::Null),
            );
            raw_row.insert(
                "payload".into(),
                Value::from(serde_json::to_string(&entry.raw)?),
            );
            raw_rows.push(InsertRow {
                insert_id: WarehouseGateway::insert_id(&[
                    &entry.form_id,
                    &entry.entry_id,
                    &update_key,
                    "raw",
                ]),
                json: raw_row,
            });

            parent_rows.push(prepared.row);
        }

        let latest_index = latest_entry_index(entries);
        let snapshot = latest_index
            .map(|i| snapshot_from_row(&parent_rows[i]))
            .unwrap_or_default();
        let latest = latest_index.map(|i| LatestInfo {
            entry_id: entries[i].entry_id.clone(),
            update_time: entries[i].update_time,
            answer_time: entries[i].answer_time,
        });
        let sub_table_ids: Vec<String> = sub_batches.keys().cloned().collect();

        if config.ingest_enabled {
            let gateway = self.gateway.as_ref().ok_or_else(|| {
                IngestionError::Configuration("Warehouse project/dataset not configured".into())
            })?;
            gateway.ensure_dataset().await?;
            let inserted_at = format_utc(Utc::now());

            // Raw landing table.
            let raw_table = format!("{table_id}_raw");
            gateway.ensure_table(&raw_table, &raw_table_columns()).await?;
            for row in &mut raw_rows {
                row.json
                    .insert("inserted_at".into(), Value::from(inserted_at.clone()));
            }
            gateway
                .insert_all(&raw_table, &raw_rows, &raw_table_columns())
                .await?;

            // Flattened parent table, schema-reconciled.
            let mut full_parent = parent_base_columns();
            full_parent.extend(parent_columns.iter().cloned());
            gateway.ensure_table(table_id, &parent_base_columns()).await?;
            let reconciliation = gateway.ensure_columns(table_id, &full_parent).await?;
            coerce_rows(&mut parent_rows, &reconciliation);
            let rows: Vec<InsertRow> = parent_rows
                .iter()
                .zip(entries)
                .map(|(row, entry)| {
                    let mut json = row.clone();
                    json.insert("inserted_at".into(), Value::from(inserted_at.clone()));
                    InsertRow {
                        insert_id: WarehouseGateway::insert_id(&[
                            &entry.form_id,
                            &entry.entry_id,
                            &entry.update_time.map(format_utc).unwrap_or_default(),
                        ]),
                        json,
                    }
                })
                .collect();
            gateway.insert_all(table_id, &rows, &full_parent).await?;

            // One table per repeating group.
            for (sub_table_id, (columns, rows)) in sub_batches.iter_mut() {
                let mut full = sub_table_base_columns();
                full.extend(columns.iter().cloned());
                gateway
                    .ensure_table(sub_table_id, &sub_table_base_columns())
                    .await?;
                let reconciliation = gateway.ensure_columns(sub_table_id, &full).await?;
                coerce_rows(rows, &reconciliation);
                let insert_rows: Vec<InsertRow> = rows
                    .iter()
                    .map(|row| {
                        let mut json = row.clone();
                        json.insert("inserted_at".into(), Value::from(inserted_at.clone()));
                        let parent = row
                            .get("parent_entry_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let index = row
                            .get("sub_row_index")
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        let update = row
                            .get("parent_update_time")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        InsertRow {
                            insert_id: WarehouseGateway::insert_id(&[
                                sub_table_id,
                                parent,
                                &index,
                                update,
                            ]),
                            json,
                        }
                    })
                    .collect();
                gateway
                    .insert_all(sub_table_id, &insert_rows, &full)
                    .await?;
            }

            // Media assets.
            if !media_rows.is_empty() {
                gateway
                    .ensure_table(MEDIA_TABLE_ID, &media_table_columns())
                    .await?;
                let insert_rows: Vec<InsertRow> = media_rows
                    .iter()
                    .map(|m| {
                        let mut json = serde_json::to_value(m)
                            .ok()
                            .and_then(|v| v.as_object().cloned())
                            .unwrap_or_default();
                        json.insert("inserted_at".into(), Value::from(inserted_at.clone()));
                        InsertRow {
                            insert_id: WarehouseGateway::insert_id(&[
                                &m.form_id,
                                &m.entry_id,
                                &m.file_id,
                            ]),
                            json,
                        }
                    })
                    .collect();
                gateway
                    .insert_all(MEDIA_TABLE_ID, &insert_rows, &media_table_columns())
                    .await?;
            }
        } else {
            tracing::info!(form_id = %config.form_id, "Warehouse ingestion disabled; skipping writes");
        }

        let dictionary = mapper.take_dictionary();
        if let Err(e) = self.store.append_dictionary(&dictionary).await {
            tracing::warn!(error = %e, "Failed to append field dictionary entries");
        }

        Ok((
            BatchOutput { latest, snapshot, sub_table_ids },
            entries.len(),
        ))
    }

    /// At-least-once consumption: a failed chunk is reported and will be
    /// re-delivered next run, never rolled back or retried here.
    async fn mark_entries_read(&self, config: &RunConfig, ids: &[String]) {
        for chunk in ids.chunks(self.options.mark_read_chunk.max(1)) {
            if let Err(e) = self
                .forms
                .mark_read_by_action(&config.form_id, &config.action, chunk)
                .await
            {
                tracing::warn!(
                    form_id = %config.form_id,
                    chunk_len = chunk.len(),
                    error = %e,
                    "Failed to mark chunk as read; entries will re-deliver next run"
                );
                self.exceptions.report(
                    &config.scope,
                    &e,
                    json!({ "stage": "mark_read", "chunk_len": chunk.len() }),
                );
            }
        }
    }

    /// External lists are only reconciled once the unread queue is drained.
    /// Syncing from a partial snapshot while more entries are pending would
    /// publish stale values.
    async fn sync_lists_if_drained(
        &self,
        config: &RunConfig,
        snapshot: &LatestRowSnapshot,
    ) -> MetadataStatus {
        match self
            .forms
            .unread_entries(&config.form_id, &config.action, 1)
            .await
        {
            Ok(payload) => {
                let pending = payload
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0);
                if pending > 0 {
                    tracing::info!(
                        form_id = %config.form_id,
                        pending = pending,
                        "Unread entries remain; deferring external-list sync"
                    );
                    return MetadataStatus::Skipped;
                }
                match lists::update_from_snapshot(self.forms.as_ref(), &config.form_id, snapshot)
                    .await
                {
                    ListSyncOutcome::Ignored => MetadataStatus::Ok("IGNORED".to_string()),
                    ListSyncOutcome::Updated { message, .. } => MetadataStatus::Ok(message),
                    ListSyncOutcome::Failed(message) => {
                        self.exceptions.report(
                            &config.scope,
                            &IngestionError::Sync(message),
                            json!({ "stage": "list_sync" }),
                        );
                        MetadataStatus::Failed
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unread re-check failed before list sync");
                MetadataStatus::Error
            }
        }
    }

    /// Best effort: a skipped or failed dedup never blocks ingestion.
    async fn maybe_dedup(
        &self,
        config: &RunConfig,
        table_id: &str,
        sub_table_ids: &[String],
        report: &mut RunReport,
    ) {
        if !self.options.dedup_enabled || !config.ingest_enabled {
            return;
        }
        let Some(gateway) = &self.gateway else { return };
        match gateway
            .run_deduplication_for_form(table_id, sub_table_ids, &self.options.dedup_wait)
            .await
        {
            Ok(dedup) => report.dedup = Some(dedup),
            Err(e) => {
                tracing::warn!(table_id = %table_id, error = %e, "Deduplication failed");
                self.exceptions.report(
                    &config.scope,
                    &e,
                    json!({ "stage": "dedup", "table_id": table_id }),
                );
            }
        }
    }

    async fn persist_metadata(
        &self,
        config: &mut RunConfig,
        latest: Option<&LatestInfo>,
        row_count: usize,
        duration_s: f64,
    ) -> Result<()> {
        if let Some(latest) = latest {
            config.last_entry_id = Some(latest.entry_id.clone());
            if let Some(update) = latest.update_time {
                config.last_update_time = Some(format_utc(update));
            }
            if let Some(answer) = latest.answer_time {
                config.last_answer_time = Some(format_utc(answer));
            }
        }
        config.last_run_at = Some(format_utc(Utc::now()));
        config.last_row_count = Some(row_count as i64);
        config.last_run_duration_s = Some(duration_s);
        config.next_run_at = config.compute_next_run();
        self.store.write_config(config).await
    }
}

fn table_id_for(config: &RunConfig) -> String {
    compute_table_name(&config.form_id, &config.form_name, &config.table_name)
}

fn summary_id(summary: &Value) -> Option<String> {
    for key in ["_id", "id", "data_id"] {
        match summary.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Index of the most recently updated entry; entries without any parseable
/// instant lose to any that have one, and the earliest-seen entry wins ties.
fn latest_entry_index(entries: &[FormEntry]) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let mut best = 0usize;
    let mut best_time = entries[0].effective_time();
    for (index, entry) in entries.iter().enumerate().skip(1) {
        let time = entry.effective_time();
        if time > best_time {
            best = index;
            best_time = time;
        }
    }
    Some(best)
}

fn snapshot_from_row(row: &Map<String, Value>) -> LatestRowSnapshot {
    let mut headers = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (key, value) in row {
        headers.push(key.clone());
        values.push(match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    LatestRowSnapshot { headers, values }
}

fn format_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn summary_in_range(summary: &Value, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    if from.is_none() && to.is_none() {
        return true;
    }
    let time = summary
        .get("answer_time")
        .or_else(|| summary.get("update_time"))
        .and_then(Value::as_str)
        .and_then(crate::models::parse_instant);
    let Some(time) = time else {
        // Range filtering is explicit; records without a date are excluded.
        return false;
    };
    let date = time.date_naive();
    if let Some(from) = from {
        if date < from {
            return false;
        }
    }
    if let Some(to) = to {
        if date > to {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_id_accepts_known_keys() {
        assert_eq!(summary_id(&json!({"_id": "a"})), Some("a".to_string()));
        assert_eq!(summary_id(&json!({"id": 7})), Some("7".to_string()));
        assert_eq!(summary_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn date_range_filter_is_inclusive() {
        let summary = json!({"answer_time": "2024-03-15 10:00:00"});
        let mar_15 = NaiveDate::from_ymd_opt(2024, 3, 15);
        let mar_16 = NaiveDate::from_ymd_opt(2024, 3, 16);
        assert!(summary_in_range(&summary, mar_15, mar_15));
        assert!(summary_in_range(&summary, None, mar_15));
        assert!(!summary_in_range(&summary, mar_16, None));
        // Undated records only pass when no filter is set.
        assert!(summary_in_range(&json!({}), None, None));
        assert!(!summary_in_range(&json!({}), mar_15, None));
    }
}
