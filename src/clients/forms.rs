//! Client for the forms platform REST API.
//!
//! [`FormsApi`] is the capability the pipeline consumes; [`KizeoClient`] is
//! the production implementation. Authentication is a pre-issued token sent
//! on every request; token lifecycle is out of scope here.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::{IngestionError, Result};

#[derive(Debug, Clone)]
pub struct ListSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ListDetail {
    pub id: String,
    pub name: String,
    pub items: Vec<String>,
}

#[async_trait]
pub trait FormsApi: Send + Sync {
    /// `GET /forms/{id}/data/unread/{action}/{limit}?includeupdated`. The
    /// raw payload is returned untouched so the unread resolver can judge
    /// its shape.
    async fn unread_entries(&self, form_id: &str, action: &str, limit: u32) -> Result<Value>;

    /// `GET /forms/{id}/data/all`: full historical summary list.
    async fn all_entries(&self, form_id: &str) -> Result<Value>;

    /// `GET /forms/{id}/data/{entry_id}`: one submission in full.
    async fn entry_detail(&self, form_id: &str, entry_id: &str) -> Result<Value>;

    /// `POST /forms/{id}/markasreadbyaction/{action}` with `{data_ids: [...]}`.
    async fn mark_read_by_action(
        &self,
        form_id: &str,
        action: &str,
        entry_ids: &[String],
    ) -> Result<()>;

    async fn lists(&self) -> Result<Vec<ListSummary>>;
    async fn list_detail(&self, list_id: &str) -> Result<ListDetail>;
    /// `PUT /lists/{id}`: whole-list replace, there is no row-level patch.
    async fn update_list(&self, list_id: &str, items: &[String]) -> Result<()>;

    /// `GET /forms/{id}/data/{entry_id}/medias/{name}`: raw asset bytes.
    async fn media(&self, form_id: &str, entry_id: &str, name: &str) -> Result<Vec<u8>>;
}

pub struct KizeoClient {
    client: Client,
    base_url: String,
    token: String,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl KizeoClient {
    pub fn new(
        base_url: String,
        token: String,
        timeout_ms: u64,
        user_agent: &str,
        max_retries: u32,
        base_backoff_ms: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(timeout_ms.min(10_000)))
            .user_agent(user_agent)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_retries,
            base_backoff_ms,
        }
    }

    /// Bounded exponential backoff on transport errors, 5xx and 429;
    /// anything else surfaces immediately.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        loop {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", &self.token)
                .header("Accept", "application/json");
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        // Some write endpoints answer with an empty body.
                        return Ok(response.json::<Value>().await.unwrap_or(Value::Null));
                    }
                    let transient =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    let text = response.text().await.unwrap_or_default();
                    if transient && attempt < self.max_retries {
                        let backoff = self.base_backoff_ms.saturating_mul(1u64 << attempt);
                        tracing::warn!(
                            path = %path,
                            status = %status,
                            attempt = attempt + 1,
                            backoff_ms = backoff,
                            "Forms API transient error; retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestionError::FormsApi(format!(
                        "{method} {path} failed: status={status} body={text}"
                    )));
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = self.base_backoff_ms.saturating_mul(1u64 << attempt);
                        tracing::warn!(
                            path = %path,
                            error = %e,
                            attempt = attempt + 1,
                            backoff_ms = backoff,
                            "Forms API request error; retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestionError::Http(e));
                }
            }
        }
    }

    async fn request_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IngestionError::FormsApi(format!(
                "GET {path} failed: status={}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl FormsApi for KizeoClient {
    async fn unread_entries(&self, form_id: &str, action: &str, limit: u32) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/forms/{form_id}/data/unread/{action}/{limit}?includeupdated"),
            None,
        )
        .await
    }

    async fn all_entries(&self, form_id: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/forms/{form_id}/data/all"), None)
            .await
    }

    async fn entry_detail(&self, form_id: &str, entry_id: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/forms/{form_id}/data/{entry_id}"), None)
            .await
    }

    async fn mark_read_by_action(
        &self,
        form_id: &str,
        action: &str,
        entry_ids: &[String],
    ) -> Result<()> {
        let body = json!({ "data_ids": entry_ids });
        self.request(
            Method::POST,
            &format!("/forms/{form_id}/markasreadbyaction/{action}"),
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn lists(&self) -> Result<Vec<ListSummary>> {
        let payload = self.request(Method::GET, "/lists", None).await?;
        let items = payload
            .get("lists")
            .or_else(|| payload.get("data"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                Some(ListSummary {
                    id: id_string(item.get("id")?),
                    name: item.get("name")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn list_detail(&self, list_id: &str) -> Result<ListDetail> {
        let payload = self
            .request(Method::GET, &format!("/lists/{list_id}"), None)
            .await?;
        let detail = payload.get("list").unwrap_or(&payload);
        let items = detail
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ListDetail {
            id: detail
                .get("id")
                .map(id_string)
                .unwrap_or_else(|| list_id.to_string()),
            name: detail
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            items,
        })
    }

    async fn update_list(&self, list_id: &str, items: &[String]) -> Result<()> {
        let body = json!({ "items": items });
        self.request(Method::PUT, &format!("/lists/{list_id}"), Some(&body))
            .await
            .map(|_| ())
    }

    async fn media(&self, form_id: &str, entry_id: &str, name: &str) -> Result<Vec<u8>> {
        self.request_bytes(&format!("/forms/{form_id}/data/{entry_id}/medias/{name}"))
            .await
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
