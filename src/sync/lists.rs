//! Sync-back of computed values into the platform's external lookup lists.
//!
//! Lists are plain item arrays in a pipe/colon micro-format. The first item
//! is the header line, `label|var:var|var:var...`; every data line carries
//! `value:var` tokens at the matching positions. A list targets a form when
//! its name follows the `"<label> || <form_id>"` convention. Updates replace
//! the whole item list, since the API has no row-level patch.

use crate::clients::FormsApi;
use crate::models::IngestionError;

/// Header/value pairs taken from the most recently processed entry's
/// flattened row; the headers are column slugs, in row order.
#[derive(Debug, Clone, Default)]
pub struct LatestRowSnapshot {
    pub headers: Vec<String>,
    pub values: Vec<String>,
}

impl LatestRowSnapshot {
    pub fn value_for(&self, header: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == header)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListSyncOutcome {
    /// Snapshot incomplete; nothing was fetched or written.
    Ignored,
    Updated { lists: usize, message: String },
    Failed(String),
}

pub fn list_targets_form(list_name: &str, form_id: &str) -> bool {
    match list_name.rsplit_once("||") {
        Some((_, suffix)) => suffix.trim() == form_id,
        None => false,
    }
}

/// Variables declared by a header line: positions whose token is `name:name`.
fn header_variables(header: &str) -> Vec<(usize, String)> {
    header
        .split('|')
        .enumerate()
        .filter_map(|(position, token)| {
            let (left, right) = token.split_once(':')?;
            if !left.is_empty() && left == right {
                Some((position, left.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Applies the snapshot to one list's items. Returns the mutated items and
/// the variables applied, or `None` when nothing changed. Variables missing
/// from the snapshot are skipped individually; partial application is fine.
pub fn apply_snapshot(items: &[String], snapshot: &LatestRowSnapshot) -> Option<(Vec<String>, Vec<String>)> {
    let header = items.first()?;
    let variables = header_variables(header);
    if variables.is_empty() {
        return None;
    }

    let mut applied = Vec::new();
    let mut out: Vec<String> = items.to_vec();
    for (position, name) in &variables {
        let Some(new_value) = snapshot.value_for(name) else {
            tracing::warn!(variable = %name, "List variable absent from snapshot; skipping");
            continue;
        };
        let suffix = format!(":{name}");
        let mut touched = false;
        for line in out.iter_mut().skip(1) {
            let mut tokens: Vec<String> = line.split('|').map(str::to_string).collect();
            // Positional match first, token-suffix scan as fallback for
            // lines with shifted columns.
            let index = tokens
                .get(*position)
                .filter(|t| t.ends_with(&suffix))
                .map(|_| *position)
                .or_else(|| tokens.iter().position(|t| t.ends_with(&suffix)));
            if let Some(index) = index {
                let replacement = format!("{new_value}{suffix}");
                if tokens[index] != replacement {
                    tokens[index] = replacement;
                    *line = tokens.join("|");
                    touched = true;
                }
            }
        }
        if touched {
            applied.push(name.clone());
        }
    }

    if applied.is_empty() {
        None
    } else {
        Some((out, applied))
    }
}

pub async fn update_from_snapshot(
    forms: &dyn FormsApi,
    form_id: &str,
    snapshot: &LatestRowSnapshot,
) -> ListSyncOutcome {
    if snapshot.headers.is_empty()
        || snapshot.values.is_empty()
        || snapshot.headers.len() != snapshot.values.len()
    {
        return ListSyncOutcome::Ignored;
    }

    let lists = match forms.lists().await {
        Ok(lists) => lists,
        Err(e) => return failed("listing external lists", e),
    };
    let targets: Vec<_> = lists
        .into_iter()
        .filter(|l| list_targets_form(&l.name, form_id))
        .collect();
    if targets.is_empty() {
        return ListSyncOutcome::Updated {
            lists: 0,
            message: "No external list targets this form".to_string(),
        };
    }

    let mut updated = 0usize;
    for summary in targets {
        let detail = match forms.list_detail(&summary.id).await {
            Ok(detail) => detail,
            Err(e) => return failed(&format!("fetching list {}", summary.id), e),
        };
        let Some((items, applied)) = apply_snapshot(&detail.items, snapshot) else {
            tracing::debug!(list_id = %summary.id, "List already in sync");
            continue;
        };
        if let Err(e) = forms.update_list(&summary.id, &items).await {
            return failed(&format!("updating list {}", summary.id), e);
        }
        tracing::info!(
            list_id = %summary.id,
            variables = %applied.join(","),
            "External list updated"
        );
        updated += 1;
    }

    ListSyncOutcome::Updated {
        lists: updated,
        message: format!("{updated} external list(s) updated"),
    }
}

fn failed(stage: &str, error: IngestionError) -> ListSyncOutcome {
    tracing::error!(stage = %stage, error = %error, "External list sync failed");
    ListSyncOutcome::Failed(format!("{stage}: {error}"))
}
