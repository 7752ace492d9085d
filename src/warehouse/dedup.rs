//! Deduplication batch job.
//!
//! Streaming inserts are at-least-once: a retried delivery or a re-fetched
//! record lands a second physical row for the same logical submission. The
//! cleanup is a windowed DELETE that keeps, per partition key, only the row
//! with the most recent update-then-insert ordering. Row-level DELETE is
//! unsafe while a table still has a young streaming buffer, so the job polls
//! buffer age with a bounded budget and reports `skipped` instead of failing
//! the run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{WarehouseClient, WarehouseGateway};
use crate::models::Result;

pub const STREAMING_BUFFER_ACTIVE: &str = "STREAMING_BUFFER_ACTIVE";

#[derive(Debug, Clone)]
pub struct DedupWaitOptions {
    /// Minimum buffer age before DELETE is considered safe.
    pub min_quiet: Duration,
    /// Total time the job may spend waiting for one table's buffer.
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for DedupWaitOptions {
    fn default() -> Self {
        Self {
            min_quiet: Duration::from_secs(90 * 60),
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDedup {
    pub table_id: String,
    pub deleted: u64,
    pub skipped: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReport {
    pub parent: TableDedup,
    pub sub_tables: Vec<TableDedup>,
}

/// Keeps the newest row per logical submission. Two physical rows sharing
/// both the partition key and `inserted_at` are indistinguishable and both
/// kept; the next run's pass picks them up once their timestamps diverge.
pub fn parent_dedup_sql(table_ref: &str) -> String {
    format!(
        "DELETE FROM `{table_ref}` AS target \
         WHERE EXISTS ( \
           SELECT 1 FROM ( \
             SELECT form_unique_id, inserted_at, \
                    ROW_NUMBER() OVER ( \
                      PARTITION BY form_unique_id \
                      ORDER BY update_time DESC, inserted_at DESC \
                    ) AS row_rank \
             FROM `{table_ref}` \
           ) AS ranked \
           WHERE ranked.row_rank > 1 \
             AND ranked.form_unique_id = target.form_unique_id \
             AND ranked.inserted_at = target.inserted_at \
         )"
    )
}

pub fn sub_table_dedup_sql(table_ref: &str) -> String {
    format!(
        "DELETE FROM `{table_ref}` AS target \
         WHERE EXISTS ( \
           SELECT 1 FROM ( \
             SELECT parent_entry_id, sub_row_index, inserted_at, \
                    ROW_NUMBER() OVER ( \
                      PARTITION BY parent_entry_id, sub_row_index \
                      ORDER BY parent_update_time DESC, inserted_at DESC \
                    ) AS row_rank \
             FROM `{table_ref}` \
           ) AS ranked \
           WHERE ranked.row_rank > 1 \
             AND ranked.parent_entry_id = target.parent_entry_id \
             AND ranked.sub_row_index = target.sub_row_index \
             AND ranked.inserted_at = target.inserted_at \
         )"
    )
}

impl WarehouseGateway {
    pub async fn run_deduplication_for_form(
        &self,
        parent_table_id: &str,
        sub_table_ids: &[String],
        options: &DedupWaitOptions,
    ) -> Result<DedupReport> {
        let parent_ref = self.config().table_ref(parent_table_id);
        let parent = self
            .dedup_table(parent_table_id, &parent_dedup_sql(&parent_ref), options)
            .await?;

        let mut sub_tables = Vec::with_capacity(sub_table_ids.len());
        for table_id in sub_table_ids {
            let table_ref = self.config().table_ref(table_id);
            sub_tables.push(
                self.dedup_table(table_id, &sub_table_dedup_sql(&table_ref), options)
                    .await?,
            );
        }

        Ok(DedupReport { parent, sub_tables })
    }

    async fn dedup_table(
        &self,
        table_id: &str,
        sql: &str,
        options: &DedupWaitOptions,
    ) -> Result<TableDedup> {
        if !self.wait_for_quiet_buffer(table_id, options).await? {
            tracing::info!(table_id = %table_id, "Streaming buffer still active; skipping dedup");
            return Ok(TableDedup {
                table_id: table_id.to_string(),
                deleted: 0,
                skipped: true,
                reason: Some(STREAMING_BUFFER_ACTIVE.to_string()),
            });
        }

        let deleted = self.client().run_dml(sql).await?;
        if deleted > 0 {
            tracing::info!(table_id = %table_id, deleted = deleted, "Deduplicated table");
        }
        Ok(TableDedup {
            table_id: table_id.to_string(),
            deleted,
            skipped: false,
            reason: None,
        })
    }

    /// Polls until the buffer is empty or old enough, within the wait budget.
    /// Returns false when the budget runs out first.
    async fn wait_for_quiet_buffer(
        &self,
        table_id: &str,
        options: &DedupWaitOptions,
    ) -> Result<bool> {
        let mut waited = Duration::ZERO;
        loop {
            match self.client().streaming_buffer_age(table_id).await? {
                None => return Ok(true),
                Some(age) if age >= options.min_quiet => return Ok(true),
                Some(age) => {
                    if waited + options.poll_interval > options.max_wait {
                        return Ok(false);
                    }
                    tracing::debug!(
                        table_id = %table_id,
                        buffer_age_s = age.as_secs(),
                        waited_s = waited.as_secs(),
                        "Waiting out streaming buffer"
                    );
                    tokio::time::sleep(options.poll_interval).await;
                    waited += options.poll_interval;
                }
            }
        }
    }
}
