//! Normalization of repeating-group payloads.
//!
//! The forms API delivers repeating groups in several shapes: a plain array
//! of row objects, an array of `{"fields": {...}}` wrappers, an object with a
//! `rows`/`data` key, a JSON-encoded string of any of those, or a single
//! row-like object. All of them collapse to a flat list of row maps here;
//! anything unrecognizable collapses to an empty list so that one malformed
//! group never aborts ingestion of the rest of the record.

use serde_json::{Map, Value};

/// Declared types the API uses for repeating groups. The declaration is not
/// reliable, which is why `is_subform_field` also probes the value shape.
const SUBFORM_TYPES: &[&str] = &["subform", "sub_form", "table", "tableau", "list", "fields"];

pub fn normalize_rows(raw: &Value) -> Vec<Map<String, Value>> {
    match raw {
        Value::Array(items) => items.iter().filter_map(normalize_row).collect(),
        Value::Object(obj) => {
            if let Some(inner) = obj.get("rows").or_else(|| obj.get("data")) {
                return normalize_rows(inner);
            }
            normalize_row(raw).into_iter().collect()
        }
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) if parsed.is_array() || parsed.is_object() => normalize_rows(&parsed),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn normalize_row(raw: &Value) -> Option<Map<String, Value>> {
    let obj = raw.as_object()?;
    let cells = match obj.get("fields") {
        Some(Value::Object(fields)) => fields,
        _ => obj,
    };

    let mut row = Map::new();
    for (name, cell) in cells {
        row.insert(name.clone(), unwrap_cell(cell));
    }
    Some(row)
}

/// `{"value": x, ...}` cells unwrap to `x`; anything else passes through.
fn unwrap_cell(cell: &Value) -> Value {
    match cell {
        Value::Object(obj) if obj.contains_key("value") => obj["value"].clone(),
        other => other.clone(),
    }
}

/// The API does not always declare repeating groups correctly, so a field
/// counts as a subform when either the declared type says so or the value
/// actually normalizes to rows.
pub fn is_subform_field(declared_type: &str, value: &Value) -> bool {
    let declared = declared_type.trim().to_lowercase();
    if SUBFORM_TYPES.contains(&declared.as_str()) {
        return true;
    }
    match value {
        Value::Array(_) | Value::Object(_) => !normalize_rows(value).is_empty(),
        Value::String(s) if s.trim_start().starts_with(['[', '{']) => {
            !normalize_rows(value).is_empty()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapped_fields_round_trip() {
        let raw = json!([{"fields": {"a": {"value": "x"}, "b": {"value": 1}}}]);
        let rows = normalize_rows(&raw);
        assert_eq!(rows, vec![json!({"a": "x", "b": 1}).as_object().unwrap().clone()]);
    }

    #[test]
    fn json_string_form_yields_same_rows() {
        let raw = json!([{"fields": {"a": {"value": "x"}, "b": {"value": 1}}}]);
        let encoded = Value::String(serde_json::to_string(&raw).unwrap());
        assert_eq!(normalize_rows(&encoded), normalize_rows(&raw));
    }

    #[test]
    fn rows_and_data_wrappers_unwrap() {
        let rows = json!({"rows": [{"a": 1}]});
        assert_eq!(normalize_rows(&rows).len(), 1);
        let data = json!({"data": [{"a": 1}, {"a": 2}]});
        assert_eq!(normalize_rows(&data).len(), 2);
    }

    #[test]
    fn single_row_like_object() {
        let raw = json!({"a": {"value": 3}, "b": "y"});
        let rows = normalize_rows(&raw);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], json!(3));
        assert_eq!(rows[0]["b"], json!("y"));
    }

    #[test]
    fn unparsable_input_is_silently_empty() {
        assert!(normalize_rows(&json!("not json")).is_empty());
        assert!(normalize_rows(&json!(42)).is_empty());
        assert!(normalize_rows(&json!(["scalar", 1])).is_empty());
    }

    #[test]
    fn subform_detection_uses_type_or_shape() {
        assert!(is_subform_field("subform", &json!(null)));
        assert!(is_subform_field("Tableau", &json!(null)));
        // Undeclared but shaped like rows.
        assert!(is_subform_field("", &json!([{"a": 1}])));
        // Neither declared nor shaped.
        assert!(!is_subform_field("text", &json!("hello")));
        assert!(!is_subform_field("number", &json!(3.5)));
    }
}
