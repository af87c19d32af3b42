// src/checkpoint/store.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::errors::{OrchestratorError, Result};
use crate::stage::record::StageRecord;

/// Persist a record to its checkpoint path.
///
/// The body is written to a sibling temp file and renamed into place, so a
/// crash mid-write never leaves a half-written checkpoint: on disk there is
/// always the snapshot of the last completed `advance()` or queue-id update.
pub fn save(record: &StageRecord) -> Result<()> {
    let path = record.checkpoint_path();
    let body = toml::to_string_pretty(record).map_err(|e| OrchestratorError::Checkpoint {
        path: path.clone(),
        reason: format!("serializing record: {e}"),
    })?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).map_err(|e| OrchestratorError::ArtifactIo {
        path: tmp.clone(),
        source: e,
    })?;
    fs::rename(&tmp, &path).map_err(|e| OrchestratorError::ArtifactIo {
        path: path.clone(),
        source: e,
    })?;

    debug!(stage = %record.name, path = ?path, "checkpoint persisted");
    Ok(())
}

/// Load a record from a checkpoint file.
pub fn load(path: &Path) -> Result<StageRecord> {
    let contents = fs::read_to_string(path).map_err(|e| OrchestratorError::ArtifactIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| OrchestratorError::Checkpoint {
        path: path.to_path_buf(),
        reason: format!("parsing record: {e}"),
    })
}

/// View a record as the TOML field table the consistency checker diffs.
pub fn record_to_table(record: &StageRecord) -> Result<toml::Table> {
    let value = toml::Value::try_from(record).map_err(|e| OrchestratorError::Checkpoint {
        path: record.checkpoint_path(),
        reason: format!("serializing record: {e}"),
    })?;
    match value {
        toml::Value::Table(table) => Ok(table),
        other => Err(OrchestratorError::Checkpoint {
            path: record.checkpoint_path(),
            reason: format!("record serialized to a non-table value: {other:?}"),
        }),
    }
}

/// Rebuild a record from a reconciled field table.
pub fn record_from_table(table: toml::Table) -> Result<StageRecord> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e| OrchestratorError::Checkpoint {
            path: std::path::PathBuf::new(),
            reason: format!("deserializing reconciled record: {e}"),
        })
}
