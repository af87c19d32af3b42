// src/stage/record.rs

//! The persistent field set of a stage.
//!
//! Everything that must survive a driver restart lives in [`StageRecord`]:
//! identity, progress flags, retry bookkeeping, queue ids, and a snapshot of
//! the backend-specific spec. The record round-trips through the checkpoint
//! store and is the unit the consistency checker diffs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, Result};
use crate::stage::roles::Need;

/// Fields excluded from consistency checking entirely: they track transient
/// progress, not the description of the calculation.
pub const SKIP_FIELDS: &[&str] = &[
    "writer_done",
    "reader_done",
    "restart_count",
    "remediation_active",
    "failed",
    "queue_ids",
];

/// Core fields that may change across reconciliation without aborting.
/// Resizing an allocation does not alter the physical result.
pub const CORE_SAFE_FIELDS: &[&str] = &["nodes"];

/// Static tagging of a backend's configuration record.
///
/// Each stage kind declares, at definition time, which of its fields are
/// allowed to drift between a checkpoint and a re-described workflow. Fields
/// not listed are checked: any difference aborts reconciliation.
pub trait StageSpec: Serialize {
    /// Backend discriminator; part of the checkpoint file name so multiple
    /// stage kinds can share a directory.
    const KIND: &'static str;

    /// Spec field names (unprefixed) in the safe allow-list.
    const SAFE_FIELDS: &'static [&'static str];
}

/// Durable snapshot of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: String,
    pub workdir: PathBuf,
    pub nodes: u32,

    #[serde(default)]
    pub writer_done: bool,
    #[serde(default)]
    pub reader_done: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub remediation_active: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub queue_ids: Vec<String>,

    /// Declared pull dependencies. Checked drift: a re-described stage that
    /// pulls from a different producer or channel gets different physical
    /// data, so reconciliation must abort rather than resume.
    #[serde(default)]
    pub needs: Vec<Need>,

    /// Backend-specific spec snapshot, diffed field-by-field under the
    /// `spec.` prefix.
    #[serde(default = "empty_table")]
    pub spec: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

impl StageRecord {
    /// Build a fresh (never-run) record for the given spec.
    pub fn new<S: StageSpec>(
        name: &str,
        workdir: &Path,
        nodes: u32,
        needs: &[Need],
        spec: &S,
    ) -> Result<Self> {
        let spec = toml::Value::try_from(spec).map_err(|e| OrchestratorError::Checkpoint {
            path: checkpoint_path(workdir, name, S::KIND),
            reason: format!("serializing stage spec: {e}"),
        })?;
        Ok(Self {
            name: name.to_string(),
            kind: S::KIND.to_string(),
            workdir: workdir.to_path_buf(),
            nodes,
            writer_done: false,
            reader_done: false,
            restart_count: 0,
            remediation_active: false,
            failed: false,
            queue_ids: Vec::new(),
            needs: needs.to_vec(),
            spec,
        })
    }

    /// A stage is complete exactly when input generation and output
    /// collection have both finished. Never stored, always recomputed.
    pub fn completed(&self) -> bool {
        self.writer_done && self.reader_done
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_path(&self.workdir, &self.name, &self.kind)
    }
}

/// Checkpoint location for a stage: keyed by name plus the backend
/// discriminator, inside the stage's working directory.
pub fn checkpoint_path(workdir: &Path, name: &str, kind: &str) -> PathBuf {
    workdir.join(format!("{name}.{kind}.stage.toml"))
}

/// Derived lifecycle position, computed fresh on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Output collected; nothing left to do.
    Done,
    /// The queue reports the external run as queued or running.
    Running,
    /// No run in the queue and no output artifact on disk.
    NotStarted,
    /// Output exists but has not been collected: either an un-collected
    /// success or a run the queue lost track of.
    ReadyForAnalysis,
}

/// Caller-facing status, distinct from the internal lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageReport {
    /// Completed.
    Ok,
    /// A killed run was remediated and retries remain.
    Retry,
    /// Still making (or waiting for) progress.
    NotFinished,
    /// Remediation budget exhausted; needs a human.
    Failed,
}
