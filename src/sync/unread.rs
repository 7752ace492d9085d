//! Resolution of the "new since last run" dataset.
//!
//! "Unread" is scoped server-side per action token. A brand-new
//! configuration has never marked anything as read, so an empty unread
//! result is ambiguous between "truly nothing" and "never initialized".
//! Resolved by falling back to the full historical list exactly once, on the
//! first run only.

use serde_json::Value;

use crate::clients::FormsApi;
use crate::models::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum UnreadOutcome {
    /// Non-empty unread set.
    Ok(Vec<Value>),
    /// Empty unread and a previous run exists: nothing to do.
    NoUnread,
    /// First run, and the full list is empty too.
    FallbackEmpty,
    /// First run: the full historical list bootstraps the pipeline.
    FallbackOk(Vec<Value>),
    /// Payload shape unrecognized; a hard error for this run.
    Invalid(String),
}

pub async fn resolve_unread(
    forms: &dyn FormsApi,
    form_id: &str,
    action: &str,
    limit: u32,
    has_previous_run: bool,
    prefetched: Option<Value>,
) -> Result<UnreadOutcome> {
    let payload = match prefetched {
        Some(payload) => payload,
        None => forms.unread_entries(form_id, action, limit).await?,
    };

    let Some(entries) = payload.get("data").and_then(Value::as_array) else {
        return Ok(UnreadOutcome::Invalid(describe_shape(&payload)));
    };

    if !entries.is_empty() {
        return Ok(UnreadOutcome::Ok(entries.clone()));
    }

    if has_previous_run {
        return Ok(UnreadOutcome::NoUnread);
    }

    tracing::info!(form_id = %form_id, action = %action, "Empty unread on first run; fetching full history");
    let full = forms.all_entries(form_id).await?;
    let Some(all_entries) = full.get("data").and_then(Value::as_array) else {
        return Ok(UnreadOutcome::Invalid(describe_shape(&full)));
    };
    if all_entries.is_empty() {
        Ok(UnreadOutcome::FallbackEmpty)
    } else {
        Ok(UnreadOutcome::FallbackOk(all_entries.clone()))
    }
}

fn describe_shape(payload: &Value) -> String {
    match payload {
        Value::Object(obj) => {
            let keys: Vec<&str> = obj.keys().map(String::as_str).take(8).collect();
            format!("object without a data array (keys: {})", keys.join(","))
        }
        other => format!("non-object payload: {}", kind_name(other)),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ListDetail, ListSummary};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubForms {
        unread: Value,
        all: Value,
    }

    #[async_trait]
    impl FormsApi for StubForms {
        async fn unread_entries(&self, _: &str, _: &str, _: u32) -> Result<Value> {
            Ok(self.unread.clone())
        }
        async fn all_entries(&self, _: &str) -> Result<Value> {
            Ok(self.all.clone())
        }
        async fn entry_detail(&self, _: &str, _: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn mark_read_by_action(&self, _: &str, _: &str, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn lists(&self) -> Result<Vec<ListSummary>> {
            Ok(Vec::new())
        }
        async fn list_detail(&self, _: &str) -> Result<ListDetail> {
            Ok(ListDetail { id: String::new(), name: String::new(), items: Vec::new() })
        }
        async fn update_list(&self, _: &str, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn media(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn non_empty_unread_wins() {
        let forms = StubForms {
            unread: json!({"data": [{"_id": "a"}]}),
            all: json!({"data": []}),
        };
        let outcome = resolve_unread(&forms, "1", "act", 50, false, None).await.unwrap();
        assert!(matches!(outcome, UnreadOutcome::Ok(entries) if entries.len() == 1));
    }

    #[tokio::test]
    async fn empty_with_previous_run_is_no_unread() {
        let forms = StubForms {
            unread: json!({"data": []}),
            all: json!({"data": [{"_id": "a"}]}),
        };
        let outcome = resolve_unread(&forms, "1", "act", 50, true, None).await.unwrap();
        assert_eq!(outcome, UnreadOutcome::NoUnread);
    }

    #[tokio::test]
    async fn first_run_falls_back_to_full_list() {
        let forms = StubForms {
            unread: json!({"data": []}),
            all: json!({"data": [{"_id": "a"}, {"_id": "b"}]}),
        };
        let outcome = resolve_unread(&forms, "1", "act", 50, false, None).await.unwrap();
        assert!(matches!(outcome, UnreadOutcome::FallbackOk(entries) if entries.len() == 2));
    }

    #[tokio::test]
    async fn first_run_with_empty_history_is_fallback_empty() {
        let forms = StubForms {
            unread: json!({"data": []}),
            all: json!({"data": []}),
        };
        let outcome = resolve_unread(&forms, "1", "act", 50, false, None).await.unwrap();
        assert_eq!(outcome, UnreadOutcome::FallbackEmpty);
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid() {
        let forms = StubForms {
            unread: json!({"status": "error"}),
            all: json!({"data": []}),
        };
        let outcome = resolve_unread(&forms, "1", "act", 50, true, None).await.unwrap();
        assert!(matches!(outcome, UnreadOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn prefetched_payload_skips_the_unread_call() {
        let forms = StubForms {
            unread: json!({"status": "would not match"}),
            all: json!({"data": []}),
        };
        let prefetched = json!({"data": [{"_id": "x"}]});
        let outcome = resolve_unread(&forms, "1", "act", 50, true, Some(prefetched))
            .await
            .unwrap();
        assert!(matches!(outcome, UnreadOutcome::Ok(_)));
    }
}
