//! Media persistence: photos and signatures referenced by form entries are
//! copied to object storage, and the warehouse rows point at the stored
//! copies. [`MediaStore`] is the capability the engine consumes; the
//! production implementation streams assets out of the forms API into S3.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use serde_json::Value;
use std::sync::Arc;

use crate::clients::FormsApi;
use crate::config::Config;
use crate::models::{IngestionError, Result};

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub file_id: String,
    pub file_name: String,
    pub storage_url: String,
    pub public_url: String,
}

/// Resolution of one media field: the string written back into the parent
/// row plus one entry per stored file.
#[derive(Debug, Clone, Default)]
pub struct ProcessedMediaField {
    pub formula: String,
    pub files: Vec<MediaFile>,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn process_field(
        &self,
        form_id: &str,
        entry_id: &str,
        field_slug: &str,
        value: &Value,
    ) -> Result<ProcessedMediaField>;
}

pub struct S3MediaStore {
    s3: S3Client,
    forms: Arc<dyn FormsApi>,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
}

impl S3MediaStore {
    pub async fn new(config: &Config, forms: Arc<dyn FormsApi>) -> Result<Self> {
        let base_loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.aws_region.clone()));
        let loader = if let (Some(access_key), Some(secret_key)) =
            (&config.aws_access_key_id, &config.aws_secret_access_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "forms-ingestion-service",
            );
            base_loader.credentials_provider(creds)
        } else {
            base_loader
        };
        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = &config.aws_endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let s3 = S3Client::from_conf(builder.build());

        Ok(Self {
            s3,
            forms,
            bucket: config.media_bucket.clone(),
            region: config.aws_region.clone(),
            public_base_url: config.media_public_base_url.clone(),
        })
    }

    fn public_url(&self, key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            let base = base.trim_end_matches('/');
            let sep = if base.ends_with('=') || base.contains('?') { "" } else { "/" };
            return format!("{base}{sep}{key}");
        }
        if self.region == "us-east-1" {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket, key)
        } else {
            format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key)
        }
    }

    async fn store_one(&self, form_id: &str, entry_id: &str, name: &str) -> Result<MediaFile> {
        let bytes = self.forms.media(form_id, entry_id, name).await?;
        let key = format!("forms/{form_id}/{entry_id}/{name}");
        let content_type = content_type_for(name);
        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                IngestionError::Sync(format!("S3 upload failed for {key}: {e}"))
            })?;

        tracing::debug!(key = %key, "Stored media asset");
        Ok(MediaFile {
            file_id: key.clone(),
            file_name: name.to_string(),
            storage_url: format!("s3://{}/{}", self.bucket, key),
            public_url: self.public_url(&key),
        })
    }
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Media values arrive as a single file name or an array of them.
pub fn media_names(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn process_field(
        &self,
        form_id: &str,
        entry_id: &str,
        field_slug: &str,
        value: &Value,
    ) -> Result<ProcessedMediaField> {
        let names = media_names(value);
        if names.is_empty() {
            return Ok(ProcessedMediaField::default());
        }

        let mut files = Vec::with_capacity(names.len());
        for name in &names {
            match self.store_one(form_id, entry_id, name).await {
                Ok(file) => files.push(file),
                // One bad asset must not sink the field, let alone the row.
                Err(e) => tracing::warn!(
                    form_id = %form_id,
                    entry_id = %entry_id,
                    field = %field_slug,
                    file = %name,
                    error = %e,
                    "Failed to store media asset"
                ),
            }
        }

        let formula = files
            .iter()
            .map(|f| f.public_url.clone())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(ProcessedMediaField { formula, files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_names_accept_string_and_array_shapes() {
        assert_eq!(media_names(&json!("a.jpg")), vec!["a.jpg"]);
        assert_eq!(media_names(&json!(["a.jpg", " b.png ", ""])), vec!["a.jpg", "b.png"]);
        assert!(media_names(&json!(null)).is_empty());
        assert!(media_names(&json!(42)).is_empty());
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("x.JPG"), "image/jpeg");
        assert_eq!(content_type_for("x.png"), "image/png");
        assert_eq!(content_type_for("x.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
