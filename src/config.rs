use serde::{Deserialize, Serialize};

use crate::sync::EngineOptions;
use crate::warehouse::{DedupWaitOptions, WarehouseConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub mongodb_uri: String,
    pub database_name: String,
    pub redis_url: String,
    pub forms_base_url: String,
    pub forms_api_token: String,
    pub http_timeout_ms: u64,
    pub http_user_agent: String,
    pub http_max_retries: u32,
    pub http_retry_backoff_ms: u64,
    pub enable_scheduler: bool,
    pub default_batch_limit: u32,
    pub mark_read_chunk: usize,
    pub fetch_parallelism: usize,
    // Warehouse
    pub warehouse_project_id: Option<String>,
    pub warehouse_dataset_id: String,
    pub warehouse_location: Option<String>,
    pub warehouse_token: Option<String>,
    pub local_timezone: String,
    pub dedup_enabled: bool,
    pub dedup_min_quiet_s: u64,
    pub dedup_max_wait_s: u64,
    pub dedup_poll_interval_s: u64,
    // Media storage
    pub media_enabled: bool,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub aws_endpoint: Option<String>,
    pub media_bucket: String,
    pub media_public_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok();

        let port: u16 = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(8091);
        let mongodb_uri =
            get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| "forms_ingestion".to_string());
        let redis_url = get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string());
        let forms_base_url =
            get("FORMS_BASE_URL").unwrap_or_else(|| "https://forms.kizeo.com/rest/v3".to_string());
        let forms_api_token = get("FORMS_API_TOKEN").unwrap_or_default();
        let http_timeout_ms: u64 = get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(60_000);
        let http_user_agent =
            get("HTTP_USER_AGENT").unwrap_or_else(|| "forms-ingestion-service/1.0".to_string());
        let http_max_retries: u32 = get("HTTP_MAX_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(3);
        let http_retry_backoff_ms: u64 =
            get("HTTP_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(500);
        let enable_scheduler: bool =
            get("ENABLE_SCHEDULER").and_then(|s| s.parse().ok()).unwrap_or(true);
        let default_batch_limit: u32 =
            get("DEFAULT_BATCH_LIMIT").and_then(|s| s.parse().ok()).unwrap_or(50);
        let mark_read_chunk: usize =
            get("MARK_READ_CHUNK").and_then(|s| s.parse().ok()).unwrap_or(50);
        let fetch_parallelism: usize =
            get("FETCH_PARALLELISM").and_then(|s| s.parse().ok()).unwrap_or(4);

        let warehouse_project_id = get("WAREHOUSE_PROJECT_ID");
        let warehouse_dataset_id =
            get("WAREHOUSE_DATASET_ID").unwrap_or_else(|| "forms".to_string());
        let warehouse_location = get("WAREHOUSE_LOCATION");
        let warehouse_token = get("WAREHOUSE_TOKEN");
        let local_timezone = get("LOCAL_TIMEZONE").unwrap_or_else(|| "Europe/Paris".to_string());
        let dedup_enabled: bool = get("DEDUP_ENABLED").and_then(|s| s.parse().ok()).unwrap_or(true);
        let dedup_min_quiet_s: u64 =
            get("DEDUP_MIN_QUIET_S").and_then(|s| s.parse().ok()).unwrap_or(90 * 60);
        let dedup_max_wait_s: u64 =
            get("DEDUP_MAX_WAIT_S").and_then(|s| s.parse().ok()).unwrap_or(120);
        let dedup_poll_interval_s: u64 =
            get("DEDUP_POLL_INTERVAL_S").and_then(|s| s.parse().ok()).unwrap_or(30);

        let media_enabled: bool = get("MEDIA_ENABLED").and_then(|s| s.parse().ok()).unwrap_or(false);
        let aws_access_key_id = get("AWS_ACCESS_KEY_ID");
        let aws_secret_access_key = get("AWS_SECRET_ACCESS_KEY");
        let aws_region = get("AWS_REGION").unwrap_or_else(|| "eu-west-1".to_string());
        let aws_endpoint = get("AWS_S3_ENDPOINT").or_else(|| get("AWS_ENDPOINT"));
        let media_bucket = get("MEDIA_BUCKET").unwrap_or_else(|| "forms-media".to_string());
        let media_public_base_url = get("MEDIA_PUBLIC_BASE_URL");

        Self {
            port,
            mongodb_uri,
            database_name,
            redis_url,
            forms_base_url,
            forms_api_token,
            http_timeout_ms,
            http_user_agent,
            http_max_retries,
            http_retry_backoff_ms,
            enable_scheduler,
            default_batch_limit,
            mark_read_chunk,
            fetch_parallelism,
            warehouse_project_id,
            warehouse_dataset_id,
            warehouse_location,
            warehouse_token,
            local_timezone,
            dedup_enabled,
            dedup_min_quiet_s,
            dedup_max_wait_s,
            dedup_poll_interval_s,
            media_enabled,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            aws_endpoint,
            media_bucket,
            media_public_base_url,
        }
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.local_timezone
            .parse()
            .unwrap_or(chrono_tz::Europe::Paris)
    }

    pub fn warehouse_config(&self) -> Option<WarehouseConfig> {
        self.warehouse_project_id
            .as_ref()
            .map(|project_id| WarehouseConfig {
                project_id: project_id.clone(),
                dataset_id: self.warehouse_dataset_id.clone(),
                location: self.warehouse_location.clone(),
            })
    }

    pub fn dedup_wait(&self) -> DedupWaitOptions {
        DedupWaitOptions {
            min_quiet: std::time::Duration::from_secs(self.dedup_min_quiet_s),
            max_wait: std::time::Duration::from_secs(self.dedup_max_wait_s),
            poll_interval: std::time::Duration::from_secs(self.dedup_poll_interval_s.max(1)),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            mark_read_chunk: self.mark_read_chunk.max(1),
            fetch_parallelism: self.fetch_parallelism.max(1),
            dedup_enabled: self.dedup_enabled,
            dedup_wait: self.dedup_wait(),
        }
    }
}
