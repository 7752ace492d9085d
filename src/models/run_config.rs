use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::models::{IngestionError, Result};

/// Per-form pipeline configuration. Read once at run start, written once at
/// run end; the `last_*` fields are the persisted incremental-sync cursor.
///
/// Field names mirror the legacy key/value layout so existing dashboards keep
/// working against the `run_configs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Unique configuration scope (one per ingested form).
    pub scope: String,
    pub form_id: String,
    pub form_name: String,
    #[serde(rename = "bq_table_name", default)]
    pub table_name: String,
    /// Action token partitioning server-side "read" state for this consumer.
    pub action: String,
    pub batch_limit: u32,
    #[serde(rename = "ingest_bigquery", default = "default_true")]
    pub ingest_enabled: bool,
    #[serde(default)]
    pub sync_lists: bool,
    #[serde(default)]
    pub store_media: bool,
    #[serde(rename = "last_data_id", default)]
    pub last_entry_id: Option<String>,
    #[serde(default)]
    pub last_update_time: Option<String>,
    #[serde(default)]
    pub last_answer_time: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<String>,
    #[serde(rename = "last_saved_row_count", default)]
    pub last_row_count: Option<i64>,
    #[serde(rename = "last_run_duration_s", default)]
    pub last_run_duration_s: Option<f64>,
    /// Cron expression driving scheduled runs; empty disables scheduling.
    #[serde(default)]
    pub trigger_frequency: String,
    #[serde(default)]
    pub next_run_at: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    pub fn new(scope: impl Into<String>, form_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            form_id: form_id.into(),
            form_name: String::new(),
            table_name: String::new(),
            action: action.into(),
            batch_limit: 50,
            ingest_enabled: true,
            sync_lists: false,
            store_media: false,
            last_entry_id: None,
            last_update_time: None,
            last_answer_time: None,
            last_run_at: None,
            last_row_count: None,
            last_run_duration_s: None,
            trigger_frequency: String::new(),
            next_run_at: None,
        }
    }

    /// An empty unread result is ambiguous on a configuration that has never
    /// completed a run; this flag disambiguates (see the unread resolver).
    pub fn has_previous_run(&self) -> bool {
        self.last_entry_id.is_some()
    }

    /// Hard-stop validation, performed before any network I/O.
    pub fn validate(&self) -> Result<()> {
        if self.form_id.trim().is_empty() {
            return Err(IngestionError::Configuration(format!(
                "config '{}' has no form_id",
                self.scope
            )));
        }
        if self.action.trim().is_empty() {
            return Err(IngestionError::Configuration(format!(
                "config '{}' has no action token",
                self.scope
            )));
        }
        Ok(())
    }

    pub fn is_due(&self) -> bool {
        match &self.next_run_at {
            Some(next) => crate::models::parse_instant(next)
                .map(|t| t <= Utc::now())
                .unwrap_or(true),
            None => true,
        }
    }

    /// Next fire time from the cron expression, or `None` when scheduling is
    /// disabled or the expression does not parse.
    pub fn compute_next_run(&self) -> Option<String> {
        if self.trigger_frequency.trim().is_empty() {
            return None;
        }
        let schedule = Schedule::from_str(self.trigger_frequency.trim()).ok()?;
        schedule.after(&Utc::now()).next().map(|t| t.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_form_and_action() {
        let mut cfg = RunConfig::new("sheet1", "", "warehouse");
        assert!(cfg.validate().is_err());
        cfg.form_id = "123".into();
        cfg.action = " ".into();
        assert!(cfg.validate().is_err());
        cfg.action = "warehouse".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn previous_run_follows_last_entry_id() {
        let mut cfg = RunConfig::new("sheet1", "123", "warehouse");
        assert!(!cfg.has_previous_run());
        cfg.last_entry_id = Some("rec-1".into());
        assert!(cfg.has_previous_run());
    }

    #[test]
    fn next_run_uses_cron_expression() {
        let mut cfg = RunConfig::new("sheet1", "123", "warehouse");
        assert!(cfg.compute_next_run().is_none());
        cfg.trigger_frequency = "0 */10 * * * *".into();
        assert!(cfg.compute_next_run().is_some());
    }
}
