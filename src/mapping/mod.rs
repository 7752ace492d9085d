//! Schema mapping: turns one decoded form entry into a flattened parent row,
//! a set of dynamically-typed columns, and one row batch per repeating group.
//!
//! Column names are derived by slugification and must be stable across runs:
//! the warehouse evolves its schema incrementally, so the same logical field
//! has to land in the same column forever. Collisions are resolved with
//! numeric suffixes in first-seen order.

pub mod subform;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::models::{FieldDictionaryEntry, FieldValue, FormEntry};
use crate::warehouse::{
    parent_base_columns, sub_table_base_columns, ColumnMode, ColumnSpec, ColumnType,
};

/// Declared types carrying media references rather than cell data.
const MEDIA_TYPES: &[&str] = &["photo", "signature", "image", "media"];

/// Output of flattening one entry. Pure data: the same entry always maps to
/// the same row, columns and subforms.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub row: Map<String, Value>,
    /// Dynamic columns only; base columns are owned by the warehouse module.
    pub columns: Vec<ColumnSpec>,
    pub subforms: Vec<SubTableBatch>,
    /// Side-channel for the media pipeline; resolved by the engine.
    pub media: Vec<MediaCandidate>,
}

#[derive(Debug, Clone)]
pub struct SubTableBatch {
    pub table_id: String,
    /// Child columns only (all STRING); tag columns are owned by the
    /// warehouse module.
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub field_name: String,
    /// Parent-row column the resolved reference is written to.
    pub column: String,
    pub field_type: String,
    pub value: Value,
}

/// Strips diacritics from the latin ranges the forms platform emits.
fn fold_char(c: char) -> &'static str {
    match c {
        'à' | 'â' | 'ä' | 'á' | 'ã' | 'å' => "a",
        'é' | 'è' | 'ê' | 'ë' => "e",
        'î' | 'ï' | 'í' | 'ì' => "i",
        'ô' | 'ö' | 'ó' | 'ò' | 'õ' => "o",
        'ù' | 'û' | 'ü' | 'ú' => "u",
        'ý' | 'ÿ' => "y",
        'ç' => "c",
        'ñ' => "n",
        'œ' => "oe",
        'æ' => "ae",
        'ß' => "ss",
        _ => "",
    }
}

/// Diacritic-stripped, lowercased, non-alphanumerics collapsed to single
/// underscores. Literal underscores survive untouched, which keeps the
/// `<form_id>__<alias>` table-name convention intact.
pub fn slugify(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for c in label.trim().to_lowercase().chars() {
        let mapped: String = if c.is_ascii_alphanumeric() || c == '_' {
            c.to_string()
        } else {
            let folded = fold_char(c);
            if folded.is_empty() {
                pending_sep = true;
                continue;
            }
            folded.to_string()
        };
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.push_str(&mapped);
    }
    out.trim_matches('_').to_string()
}

/// First-seen-order collision avoidance: `field`, `field_1`, `field_2`, …
pub fn ensure_unique_name(base: &str, used: &mut HashSet<String>) -> String {
    let base = if base.is_empty() { "field" } else { base };
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Derives the warehouse table id for a form: the slug of an explicit
/// candidate when one is configured, `<form_id>__<slug(form_name)>`
/// otherwise. The `<form_id>__` prefix is enforced either way.
pub fn compute_table_name(form_id: &str, form_name: &str, candidate: &str) -> String {
    let slug = slugify(candidate);
    let prefix = format!("{form_id}__");
    if slug.is_empty() {
        return format!("{prefix}{}", slugify(form_name));
    }
    if slug.starts_with(&prefix) {
        slug
    } else {
        format!("{prefix}{slug}")
    }
}

/// Strips the `<form_id>__` prefix off a table name.
pub fn extract_alias_part(table_name: &str, form_id: &str) -> String {
    let prefix = format!("{form_id}__");
    table_name
        .strip_prefix(&prefix)
        .unwrap_or(table_name)
        .to_string()
}

enum FieldKind {
    Float,
    Int,
    Bool,
    Date,
    Time,
    Timestamp,
    Text,
}

fn kind_for(declared_type: &str) -> FieldKind {
    match declared_type.trim().to_lowercase().as_str() {
        "number" | "numeric" | "float" | "decimal" | "double" => FieldKind::Float,
        "integer" | "int" => FieldKind::Int,
        "boolean" | "bool" | "yesno" | "checkbox" => FieldKind::Bool,
        "date" => FieldKind::Date,
        "time" => FieldKind::Time,
        "datetime" | "timestamp" => FieldKind::Timestamp,
        _ => FieldKind::Text,
    }
}

/// Tolerates the comma decimal separator French forms produce.
fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| parse_float(value).filter(|f| f.fract() == 0.0).map(|f| f as i64))
        }
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn format_date(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    crate::models::parse_instant(s).map(|t| t.date_naive().format("%Y-%m-%d").to_string())
}

/// `HH:MM:SS`, tolerant of a missing seconds component.
fn format_time(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    for format in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(s, format) {
            return Some(t.format("%H:%M:%S").to_string());
        }
    }
    crate::models::parse_instant(s).map(|t| t.format("%H:%M:%S").to_string())
}

fn format_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_local(t: DateTime<Utc>, tz: Tz) -> String {
    t.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn render_plain(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s.clone()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        other => Value::String(serde_json::to_string(other).unwrap_or_default()),
    }
}

/// Serializes one sub-table cell: arrays joined, objects JSON-stringified,
/// scalars rendered plainly.
fn stringify_cell(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(|v| match render_plain(v) {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");
            Value::String(joined)
        }
        other => render_plain(other),
    }
}

enum Converted {
    Single(ColumnType, Value),
    /// A UTC instant plus its fixed-local-timezone rendering; the two
    /// columns are always written together.
    WithLocal { value: Value, local: Value },
    Repeated(ColumnType, Vec<Value>),
    RepeatedWithLocal { values: Vec<Value>, locals: Vec<Value> },
}

fn convert_one(kind: &FieldKind, value: &Value, tz: Tz) -> (ColumnType, Value, Option<Value>) {
    match kind {
        FieldKind::Float => (
            ColumnType::Float64,
            parse_float(value).map(Value::from).unwrap_or(Value::Null),
            None,
        ),
        FieldKind::Int => (
            ColumnType::Int64,
            parse_int(value).map(Value::from).unwrap_or(Value::Null),
            None,
        ),
        FieldKind::Bool => (
            ColumnType::Bool,
            parse_bool(value).map(Value::from).unwrap_or(Value::Null),
            None,
        ),
        FieldKind::Date => (
            ColumnType::Date,
            format_date(value).map(Value::from).unwrap_or(Value::Null),
            None,
        ),
        FieldKind::Time => (
            ColumnType::Time,
            format_time(value).map(Value::from).unwrap_or(Value::Null),
            None,
        ),
        FieldKind::Timestamp => {
            let instant = value.as_str().and_then(crate::models::parse_instant);
            match instant {
                Some(t) => (
                    ColumnType::Timestamp,
                    Value::from(format_utc(t)),
                    Some(Value::from(format_local(t, tz))),
                ),
                None => (ColumnType::Timestamp, Value::Null, Some(Value::Null)),
            }
        }
        FieldKind::Text => (ColumnType::String, render_plain(value), None),
    }
}

fn convert_scalar(declared_type: &str, value: &Value, tz: Tz) -> Converted {
    let kind = kind_for(declared_type);
    if let Value::Array(items) = value {
        if matches!(kind, FieldKind::Timestamp) {
            let mut values = Vec::with_capacity(items.len());
            let mut locals = Vec::with_capacity(items.len());
            for item in items {
                let (_, v, local) = convert_one(&kind, item, tz);
                values.push(v);
                locals.push(local.unwrap_or(Value::Null));
            }
            return Converted::RepeatedWithLocal { values, locals };
        }
        let mut column_type = ColumnType::String;
        let values = items
            .iter()
            .map(|item| {
                let (ty, v, _) = convert_one(&kind, item, tz);
                column_type = ty;
                v
            })
            .collect();
        return Converted::Repeated(column_type, values);
    }

    let (ty, v, local) = convert_one(&kind, value, tz);
    match local {
        Some(local) => Converted::WithLocal { value: v, local },
        None => Converted::Single(ty, v),
    }
}

/// Flattens entries into warehouse rows. One mapper instance lives for one
/// pipeline run; it deduplicates field-dictionary entries across all the
/// entries of the batch.
pub struct SchemaMapper {
    timezone: Tz,
    seen_columns: HashSet<(String, String)>,
    dictionary: Vec<FieldDictionaryEntry>,
}

impl SchemaMapper {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            seen_columns: HashSet::new(),
            dictionary: Vec::new(),
        }
    }

    /// Dictionary entries accumulated so far, drained for persistence at the
    /// end of the batch.
    pub fn take_dictionary(&mut self) -> Vec<FieldDictionaryEntry> {
        std::mem::take(&mut self.dictionary)
    }

    pub fn prepare_parent_row(&mut self, table_id: &str, entry: &FormEntry) -> PreparedEntry {
        let mut row = Map::new();
        row.insert("entry_id".into(), Value::from(entry.entry_id.clone()));
        row.insert("form_id".into(), Value::from(entry.form_id.clone()));
        row.insert("form_unique_id".into(), opt_string(&entry.unique_id));
        row.insert("user_id".into(), opt_string(&entry.user_id));
        row.insert("user_name".into(), opt_string(&entry.user_name));
        row.insert("origin".into(), opt_string(&entry.origin));
        let (answer, answer_local) = instant_pair(entry.answer_time, self.timezone);
        row.insert("answer_time".into(), answer);
        row.insert("answer_time_cet".into(), answer_local);
        let (update, update_local) = instant_pair(entry.update_time, self.timezone);
        row.insert("update_time".into(), update);
        row.insert("update_time_cet".into(), update_local);

        let mut used: HashSet<String> = parent_base_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut columns = Vec::new();
        let mut subforms = Vec::new();
        let mut media = Vec::new();

        for (name, field) in &entry.fields {
            let slug = slugify(name);
            match field {
                FieldValue::Repeating { field_type, rows } => {
                    let sub_table_id = format!("{table_id}__{slug}");
                    let ref_column = ensure_unique_name(&format!("table_{slug}"), &mut used);
                    let count_column =
                        ensure_unique_name(&format!("table_{slug}_row_count"), &mut used);

                    let reference = if rows.is_empty() {
                        Value::Null
                    } else {
                        Value::from(sub_table_id.clone())
                    };
                    row.insert(ref_column.clone(), reference);
                    row.insert(count_column.clone(), Value::from(rows.len() as i64));
                    columns.push(ColumnSpec::nullable(ref_column.clone(), ColumnType::String));
                    columns.push(ColumnSpec::nullable(count_column, ColumnType::Int64));
                    self.log_column(table_id, &ref_column, name, (ColumnType::String, ColumnMode::Nullable), field_type);

                    if !rows.is_empty() {
                        subforms.push(self.prepare_sub_table(&sub_table_id, entry, rows));
                    }
                }
                FieldValue::Scalar { field_type, value } => {
                    if MEDIA_TYPES.contains(&field_type.trim().to_lowercase().as_str()) {
                        let column = ensure_unique_name(&slug, &mut used);
                        row.insert(column.clone(), stringify_cell(value));
                        columns.push(ColumnSpec::nullable(column.clone(), ColumnType::String));
                        self.log_column(table_id, &column, name, (ColumnType::String, ColumnMode::Nullable), field_type);
                        media.push(MediaCandidate {
                            field_name: name.clone(),
                            column,
                            field_type: field_type.clone(),
                            value: value.clone(),
                        });
                        continue;
                    }

                    match convert_scalar(field_type, value, self.timezone) {
                        Converted::Single(ty, v) => {
                            let column = ensure_unique_name(&slug, &mut used);
                            row.insert(column.clone(), v);
                            columns.push(ColumnSpec::nullable(column.clone(), ty));
                            self.log_column(table_id, &column, name, (ty, ColumnMode::Nullable), field_type);
                        }
                        Converted::WithLocal { value: v, local } => {
                            let column = ensure_unique_name(&slug, &mut used);
                            let local_column =
                                ensure_unique_name(&format!("{column}_cet"), &mut used);
                            row.insert(column.clone(), v);
                            row.insert(local_column.clone(), local);
                            columns.push(ColumnSpec::nullable(
                                column.clone(),
                                ColumnType::Timestamp,
                            ));
                            columns.push(ColumnSpec::nullable(local_column, ColumnType::DateTime));
                            self.log_column(
                                table_id,
                                &column,
                                name,
                                (ColumnType::Timestamp, ColumnMode::Nullable),
                                field_type,
                            );
                        }
                        Converted::Repeated(ty, values) => {
                            let column = ensure_unique_name(&slug, &mut used);
                            row.insert(column.clone(), Value::Array(values));
                            columns.push(ColumnSpec::repeated(column.clone(), ty));
                            self.log_column(table_id, &column, name, (ty, ColumnMode::Repeated), field_type);
                        }
                        Converted::RepeatedWithLocal { values, locals } => {
                            let column = ensure_unique_name(&slug, &mut used);
                            let local_column =
                                ensure_unique_name(&format!("{column}_cet"), &mut used);
                            row.insert(column.clone(), Value::Array(values));
                            row.insert(local_column.clone(), Value::Array(locals));
                            columns.push(ColumnSpec::repeated(
                                column.clone(),
                                ColumnType::Timestamp,
                            ));
                            columns.push(ColumnSpec::repeated(local_column, ColumnType::DateTime));
                            self.log_column(
                                table_id,
                                &column,
                                name,
                                (ColumnType::Timestamp, ColumnMode::Repeated),
                                field_type,
                            );
                        }
                    }
                }
            }
        }

        PreparedEntry { row, columns, subforms, media }
    }

    fn prepare_sub_table(
        &mut self,
        sub_table_id: &str,
        entry: &FormEntry,
        rows: &[Map<String, Value>],
    ) -> SubTableBatch {
        // Union of child columns in first-seen order, one stable slug per key.
        let mut used: HashSet<String> = sub_table_base_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        let mut column_order: Vec<(String, String)> = Vec::new();
        for row in rows {
            for key in row.keys() {
                if column_order.iter().any(|(k, _)| k == key) {
                    continue;
                }
                let column = ensure_unique_name(&slugify(key), &mut used);
                self.log_column(sub_table_id, &column, key, (ColumnType::String, ColumnMode::Nullable), "subform");
                column_order.push((key.clone(), column));
            }
        }

        let mut out_rows = Vec::with_capacity(rows.len());
        for (index, source) in rows.iter().enumerate() {
            let mut out = Map::new();
            out.insert("parent_entry_id".into(), Value::from(entry.entry_id.clone()));
            out.insert("parent_form_unique_id".into(), opt_string(&entry.unique_id));
            out.insert("sub_row_index".into(), Value::from(index as i64));
            let (answer, _) = instant_pair(entry.answer_time, self.timezone);
            out.insert("parent_answer_time".into(), answer);
            let (update, _) = instant_pair(entry.update_time, self.timezone);
            out.insert("parent_update_time".into(), update);
            for (key, column) in &column_order {
                let value = source.get(key).map(stringify_cell).unwrap_or(Value::Null);
                out.insert(column.clone(), value);
            }
            out_rows.push(out);
        }

        SubTableBatch {
            table_id: sub_table_id.to_string(),
            columns: column_order
                .into_iter()
                .map(|(_, column)| ColumnSpec::nullable(column, ColumnType::String))
                .collect(),
            rows: out_rows,
        }
    }

    fn log_column(
        &mut self,
        table_id: &str,
        column: &str,
        label: &str,
        spec: (ColumnType, ColumnMode),
        source_type: &str,
    ) {
        if !self
            .seen_columns
            .insert((table_id.to_string(), column.to_string()))
        {
            return;
        }
        self.dictionary.push(FieldDictionaryEntry {
            table_id: table_id.to_string(),
            field_slug: column.to_string(),
            label: label.to_string(),
            column_type: spec.0.as_sql().to_string(),
            mode: spec.1.as_sql().to_string(),
            source_type: source_type.to_string(),
            last_seen_at: format_utc(Utc::now()),
        });
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map(Value::from).unwrap_or(Value::Null)
}

fn instant_pair(instant: Option<DateTime<Utc>>, tz: Tz) -> (Value, Value) {
    match instant {
        Some(t) => (
            Value::from(format_utc(t)),
            Value::from(format_local(t, tz)),
        ),
        None => (Value::Null, Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FormEntry;
    use serde_json::json;

    fn mapper() -> SchemaMapper {
        SchemaMapper::new(chrono_tz::Europe::Paris)
    }

    fn entry_with_fields(fields: Value) -> FormEntry {
        let payload = json!({
            "data": {
                "id": "rec-001",
                "form_unique_id": "u-001",
                "answer_time": "2024-03-01 08:30:00",
                "update_time": "2024-03-02 09:00:00",
                "fields": fields,
            }
        });
        FormEntry::from_detail("123", &payload).unwrap()
    }

    #[test]
    fn slugify_strips_diacritics_and_separators() {
        assert_eq!(slugify("Température / Eau"), "temperature_eau");
        assert_eq!(slugify("  Déjà vu!  "), "deja_vu");
        assert_eq!(slugify("a__b"), "a__b");
    }

    #[test]
    fn unique_names_suffix_in_order() {
        let mut used: HashSet<String> = ["field".to_string(), "field_1".to_string()]
            .into_iter()
            .collect();
        assert_eq!(ensure_unique_name("field", &mut used), "field_2");
        assert_eq!(ensure_unique_name("field", &mut used), "field_3");
    }

    #[test]
    fn table_name_from_candidate_or_form_name() {
        assert_eq!(
            compute_table_name("123", "Formulaire Éxemple", " 123__mesures journalières "),
            "123__mesures_journalieres"
        );
        assert_eq!(
            compute_table_name("123", "Formulaire Éxemple", ""),
            "123__formulaire_exemple"
        );
        assert_eq!(compute_table_name("123", "X", "relevés"), "123__releves");
    }

    #[test]
    fn alias_part_strips_form_prefix() {
        assert_eq!(extract_alias_part("123__nom", "123"), "nom");
        assert_eq!(extract_alias_part("nom", "123"), "nom");
    }

    #[test]
    fn flattening_is_idempotent() {
        let entry = entry_with_fields(json!({
            "temperature": {"type": "number", "value": "18.7"},
            "ok": {"type": "yesno", "value": "yes"},
        }));
        let mut m1 = mapper();
        let first = m1.prepare_parent_row("123__t", &entry);
        let mut m2 = mapper();
        let second = m2.prepare_parent_row("123__t", &entry);

        assert_eq!(first.row, second.row);
        assert_eq!(first.columns, second.columns);
        assert_eq!(first.row["temperature"], json!(18.7));
        assert_eq!(first.row["ok"], json!(true));
        let temp_spec = first.columns.iter().find(|c| c.name == "temperature").unwrap();
        assert_eq!(temp_spec.column_type, ColumnType::Float64);
        let ok_spec = first.columns.iter().find(|c| c.name == "ok").unwrap();
        assert_eq!(ok_spec.column_type, ColumnType::Bool);
    }

    #[test]
    fn parse_failures_become_null_not_errors() {
        let entry = entry_with_fields(json!({
            "temperature": {"type": "number", "value": "n/a"},
            "done": {"type": "checkbox", "value": "maybe"},
            "quantite": {"type": "integer", "value": "12"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["temperature"], Value::Null);
        assert_eq!(prepared.row["done"], Value::Null);
        assert_eq!(prepared.row["quantite"], json!(12));
    }

    #[test]
    fn comma_decimals_parse() {
        let entry = entry_with_fields(json!({
            "poids": {"type": "decimal", "value": "12,5"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["poids"], json!(12.5));
    }

    #[test]
    fn timestamps_always_carry_local_companion() {
        let entry = entry_with_fields(json!({
            "controle": {"type": "datetime", "value": "2024-06-15 12:00:00"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["controle"], json!("2024-06-15T12:00:00Z"));
        // Paris is UTC+2 on that date.
        assert_eq!(prepared.row["controle_cet"], json!("2024-06-15 14:00:00"));
        let names: Vec<&str> = prepared.columns.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"controle"));
        assert!(names.contains(&"controle_cet"));

        // Unparseable instants still write both columns, as nulls.
        let entry = entry_with_fields(json!({
            "controle": {"type": "datetime", "value": "soon"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["controle"], Value::Null);
        assert_eq!(prepared.row["controle_cet"], Value::Null);
    }

    #[test]
    fn time_tolerates_missing_seconds() {
        let entry = entry_with_fields(json!({
            "heure": {"type": "time", "value": "08:15"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["heure"], json!("08:15:00"));
    }

    #[test]
    fn arrays_become_repeated_columns() {
        let entry = entry_with_fields(json!({
            "valeurs": {"type": "number", "value": ["1", "2,5", "bad"]},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["valeurs"], json!([1.0, 2.5, null]));
        let spec = prepared.columns.iter().find(|c| c.name == "valeurs").unwrap();
        assert_eq!(spec.mode, crate::warehouse::ColumnMode::Repeated);
        assert_eq!(spec.column_type, ColumnType::Float64);
    }

    #[test]
    fn objects_serialize_to_json_strings() {
        let entry = entry_with_fields(json!({
            "geo": {"type": "geoloc", "value": {"lat": 1.0, "lon": 2.0}},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        let text = prepared.row["geo"].as_str().unwrap();
        assert!(text.contains("\"lat\""));
    }

    #[test]
    fn repeating_groups_extract_to_sub_tables() {
        let entry = entry_with_fields(json!({
            "mesures": {"type": "subform", "value": [
                {"fields": {"Température / Eau": {"value": "17,5"}, "remarque": {"value": "ok"}}},
                {"fields": {"Température / Eau": {"value": "18"}}}
            ]},
        }));
        let prepared = mapper().prepare_parent_row("123__journal", &entry);

        assert_eq!(prepared.row["table_mesures"], json!("123__journal__mesures"));
        assert_eq!(prepared.row["table_mesures_row_count"], json!(2));
        assert_eq!(prepared.subforms.len(), 1);

        let batch = &prepared.subforms[0];
        assert_eq!(batch.table_id, "123__journal__mesures");
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[0]["parent_entry_id"], json!("rec-001"));
        assert_eq!(batch.rows[0]["sub_row_index"], json!(0));
        assert_eq!(batch.rows[1]["sub_row_index"], json!(1));
        assert_eq!(batch.rows[0]["temperature_eau"], json!("17,5"));
        // Missing child cell in the second row stays null.
        assert_eq!(batch.rows[1]["remarque"], Value::Null);
        assert!(batch
            .columns
            .iter()
            .all(|c| c.column_type == ColumnType::String));
    }

    #[test]
    fn empty_repeating_group_keeps_columns_null() {
        let entry = entry_with_fields(json!({
            "mesures": {"type": "subform", "value": []},
        }));
        let prepared = mapper().prepare_parent_row("123__journal", &entry);
        assert_eq!(prepared.row["table_mesures"], Value::Null);
        assert_eq!(prepared.row["table_mesures_row_count"], json!(0));
        assert!(prepared.subforms.is_empty());
    }

    #[test]
    fn media_fields_are_emitted_as_candidates() {
        let entry = entry_with_fields(json!({
            "photo chantier": {"type": "photo", "value": "IMG_1.jpg"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.media.len(), 1);
        assert_eq!(prepared.media[0].column, "photo_chantier");
        assert_eq!(prepared.row["photo_chantier"], json!("IMG_1.jpg"));
    }

    #[test]
    fn dictionary_logs_each_column_once_per_run() {
        let entry = entry_with_fields(json!({
            "temperature": {"type": "number", "value": "18.7"},
        }));
        let mut m = mapper();
        m.prepare_parent_row("123__t", &entry);
        m.prepare_parent_row("123__t", &entry);
        let dictionary = m.take_dictionary();
        let temp_entries: Vec<_> = dictionary
            .iter()
            .filter(|e| e.field_slug == "temperature")
            .collect();
        assert_eq!(temp_entries.len(), 1);
        assert_eq!(temp_entries[0].column_type, "FLOAT64");
    }

    #[test]
    fn colliding_labels_get_stable_suffixes() {
        let entry = entry_with_fields(json!({
            "mesure eau": {"type": "number", "value": "1"},
            "Mesure / Eau": {"type": "number", "value": "2"},
        }));
        let prepared = mapper().prepare_parent_row("123__t", &entry);
        assert_eq!(prepared.row["mesure_eau"], json!(1.0));
        assert_eq!(prepared.row["mesure_eau_1"], json!(2.0));
    }
}
