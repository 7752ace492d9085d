use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::mapping::subform;

/// A single answer field, resolved once at the ingestion boundary.
///
/// The upstream API is schema-less: repeating groups are not always declared
/// as such, values arrive as strings, arrays or nested objects. Everything
/// downstream of the decode step works with this tagged form, never with raw
/// maps.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar {
        field_type: String,
        value: Value,
    },
    Repeating {
        field_type: String,
        rows: Vec<Map<String, Value>>,
    },
}

impl FieldValue {
    pub fn field_type(&self) -> &str {
        match self {
            FieldValue::Scalar { field_type, .. } => field_type,
            FieldValue::Repeating { field_type, .. } => field_type,
        }
    }
}

/// One form submission as fetched from the detail endpoint. Immutable once
/// decoded; lives for a single pipeline iteration.
#[derive(Debug, Clone)]
pub struct FormEntry {
    pub form_id: String,
    pub entry_id: String,
    pub unique_id: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub origin: Option<String>,
    pub answer_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    /// Field order as delivered by the API; drives first-seen column naming.
    pub fields: Vec<(String, FieldValue)>,
    /// Raw detail payload, kept verbatim for the raw-JSON table.
    pub raw: Value,
}

impl FormEntry {
    /// Decodes a detail payload (`{"data": {...}}` or the bare object).
    /// Returns `None` when no stable id can be found; the caller logs and
    /// skips such records rather than failing the batch.
    pub fn from_detail(form_id: &str, payload: &Value) -> Option<Self> {
        let data = payload.get("data").unwrap_or(payload);
        let entry_id = string_at(data, &["_id", "id", "data_id"])?;

        let mut fields = Vec::new();
        if let Some(raw_fields) = data.get("fields").and_then(|v| v.as_object()) {
            for (name, cell) in raw_fields {
                fields.push((name.clone(), decode_field(cell)));
            }
        }

        Some(Self {
            form_id: form_id.to_string(),
            entry_id,
            unique_id: string_at(data, &["form_unique_id", "unique_id"]),
            user_id: string_at(data, &["user_id"]),
            user_name: string_at(data, &["user_name", "username"]),
            origin: string_at(data, &["origin_answer", "origin"]),
            answer_time: data
                .get("answer_time")
                .and_then(Value::as_str)
                .and_then(parse_instant),
            update_time: data
                .get("update_time")
                .or_else(|| data.get("update_answer_time"))
                .and_then(Value::as_str)
                .and_then(parse_instant),
            fields,
            raw: payload.clone(),
        })
    }

    /// Instant used to pick the most recently updated entry of a batch:
    /// update time when present, answer time otherwise.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.update_time.or(self.answer_time)
    }
}

fn decode_field(cell: &Value) -> FieldValue {
    let field_type = cell
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let value = cell.get("value").cloned().unwrap_or_else(|| cell.clone());

    if subform::is_subform_field(&field_type, &value) {
        FieldValue::Repeating {
            field_type,
            rows: subform::normalize_rows(&value),
        }
    } else {
        FieldValue::Scalar { field_type, value }
    }
}

fn string_at(data: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match data.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Lenient instant parsing: RFC 3339 first, then the space- and T-separated
/// naive forms the forms API emits, interpreted as UTC.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_detail_with_scalar_and_subform_fields() {
        let payload = json!({
            "data": {
                "id": "rec-1",
                "form_unique_id": "u-1",
                "user_id": "42",
                "answer_time": "2024-03-01 08:30:00",
                "update_time": "2024-03-02T09:00:00Z",
                "fields": {
                    "temperature": {"type": "number", "value": "18.7"},
                    "mesures": {"type": "subform", "value": [{"fields": {"a": {"value": "x"}}}]}
                }
            }
        });
        let entry = FormEntry::from_detail("123", &payload).unwrap();
        assert_eq!(entry.entry_id, "rec-1");
        assert_eq!(entry.unique_id.as_deref(), Some("u-1"));
        assert!(entry.answer_time.is_some());
        assert_eq!(entry.fields.len(), 2);
        match &entry.fields.iter().find(|(n, _)| n == "mesures").unwrap().1 {
            FieldValue::Repeating { rows, .. } => assert_eq!(rows.len(), 1),
            other => panic!("expected repeating field, got {:?}", other),
        }
    }

    #[test]
    fn missing_id_yields_none() {
        let payload = json!({"data": {"fields": {}}});
        assert!(FormEntry::from_detail("123", &payload).is_none());
    }

    #[test]
    fn effective_time_prefers_update_time() {
        let payload = json!({
            "data": {
                "id": "rec-2",
                "answer_time": "2024-01-01 00:00:00",
                "update_time": "2024-06-01 00:00:00",
                "fields": {}
            }
        });
        let entry = FormEntry::from_detail("1", &payload).unwrap();
        assert_eq!(entry.effective_time(), entry.update_time);
    }

    #[test]
    fn parse_instant_accepts_known_shapes() {
        for s in [
            "2024-03-01T10:00:00Z",
            "2024-03-01 10:00:00",
            "2024-03-01T10:00:00",
            "2024-03-01 10:00",
        ] {
            assert!(parse_instant(s).is_some(), "failed on {:?}", s);
        }
        assert!(parse_instant("not a date").is_none());
    }
}
