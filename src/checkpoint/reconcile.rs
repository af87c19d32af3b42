// src/checkpoint/reconcile.rs

//! Structural diff and allow-list-based safe merge.
//!
//! Field tables are flattened to dotted names (`spec.command`,
//! `spec.exports.k0`) and compared value-by-value. Skip-listed fields are
//! excluded entirely; differing fields outside the safe allow-list make the
//! merge illegal. This is what lets an operator re-describe the same workflow
//! and have it treated as "resume", while drift that would silently change
//! the physical result aborts loudly instead.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{OrchestratorError, Result};

/// Outcome of comparing an old (persisted) field table to a new (requested)
/// one. Skip-listed fields appear in neither partition.
#[derive(Debug, Clone, Default)]
pub struct FieldDiff {
    pub identical: Vec<String>,
    pub differing: Vec<String>,
}

/// Compare two field tables, ignoring `skip`-listed fields.
///
/// A field present on only one side counts as differing.
pub fn diff(old: &toml::Table, new: &toml::Table, skip: &[impl AsRef<str>]) -> FieldDiff {
    let old_flat = flatten(old);
    let new_flat = flatten(new);

    let mut report = FieldDiff::default();
    for field in union_keys(&old_flat, &new_flat) {
        if is_listed(&field, skip) {
            continue;
        }
        if old_flat.get(&field) == new_flat.get(&field) {
            report.identical.push(field);
        } else {
            report.differing.push(field);
        }
    }
    report
}

/// Merge `new` onto `old` under the safe-field allow-list.
///
/// - Differing fields in `safe` are overwritten on the old table from the new
///   one (entries may match a safe name exactly or live beneath it).
/// - Any differing field outside `safe` aborts with
///   [`OrchestratorError::ConfigConflict`] before anything is mutated.
/// - Skip-listed fields keep their old (persisted) values untouched.
///
/// Returns the merged table and whether any safe field actually changed, so
/// the caller knows to regenerate input and re-persist.
pub fn reconcile(
    old: &toml::Table,
    new: &toml::Table,
    safe: &[impl AsRef<str>],
    skip: &[impl AsRef<str>],
    stage: &str,
) -> Result<(toml::Table, bool)> {
    let old_flat = flatten(old);
    let new_flat = flatten(new);

    let mut merged = old_flat.clone();
    let mut changed = false;

    for field in union_keys(&old_flat, &new_flat) {
        if is_listed(&field, skip) {
            continue;
        }
        if old_flat.get(&field) == new_flat.get(&field) {
            continue;
        }
        if !is_listed(&field, safe) {
            return Err(OrchestratorError::ConfigConflict {
                stage: stage.to_string(),
                field,
            });
        }

        debug!(stage, field = %field, "overwriting safe field from requested configuration");
        match new_flat.get(&field) {
            Some(value) => {
                merged.insert(field, value.clone());
            }
            None => {
                merged.remove(&field);
            }
        }
        changed = true;
    }

    Ok((unflatten(&merged), changed))
}

/// Flatten nested tables into dotted field names. Leaf values (including
/// arrays) are compared as a whole.
fn flatten(table: &toml::Table) -> BTreeMap<String, toml::Value> {
    fn walk(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, toml::Value>) {
        for (key, value) in table.iter() {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                toml::Value::Table(inner) => walk(&name, inner, out),
                leaf => {
                    out.insert(name, leaf.clone());
                }
            }
        }
    }

    let mut out = BTreeMap::new();
    walk("", table, &mut out);
    out
}

/// Rebuild a nested table from dotted field names.
fn unflatten(flat: &BTreeMap<String, toml::Value>) -> toml::Table {
    let mut root = toml::Table::new();
    for (name, value) in flat.iter() {
        let mut parts = name.split('.').peekable();
        let mut current = &mut root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                current.insert(part.to_string(), value.clone());
            } else {
                let entry = current
                    .entry(part.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                current = match entry {
                    toml::Value::Table(inner) => inner,
                    // A leaf and a table cannot share a dotted prefix in a
                    // flattened record; keep the table.
                    other => {
                        *other = toml::Value::Table(toml::Table::new());
                        match other {
                            toml::Value::Table(inner) => inner,
                            _ => unreachable!(),
                        }
                    }
                };
            }
        }
    }
    root
}

/// True if `field` matches a listed name exactly or lives beneath it
/// (`spec.exports` covers `spec.exports.k0`).
fn is_listed(field: &str, list: &[impl AsRef<str>]) -> bool {
    list.iter().any(|entry| {
        let entry = entry.as_ref();
        field == entry || (field.len() > entry.len() && field.starts_with(entry) && field.as_bytes()[entry.len()] == b'.')
    })
}

fn union_keys(
    a: &BTreeMap<String, toml::Value>,
    b: &BTreeMap<String, toml::Value>,
) -> Vec<String> {
    let mut keys: Vec<String> = a.keys().chain(b.keys()).cloned().collect();
    keys.sort();
    keys.dedup();
    keys
}
