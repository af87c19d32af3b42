// src/stage/roles.rs

//! Capability roles composed by a stage.
//!
//! A stage never knows what calculation it is running; it calls this fixed
//! contract on whatever writer/runner/reader triple it was built with. One
//! generic implementation lives in `backend::script`; tests use fakes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::queue::QueueState;

/// The files a producer hands to consumers for one channel.
pub type ArtifactSet = Vec<PathBuf>;

/// Inputs a job resolved for a consumer stage before its tick:
/// channel name -> absolute artifact paths pulled from the producer.
pub type ResolvedInputs = BTreeMap<String, ArtifactSet>;

/// One declared dependency edge, resolved on demand. Part of the persisted
/// record: rewiring a stage to a different producer changes whose data feeds
/// the input, so it is checked drift, not a transient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Need {
    pub producer: String,
    pub channel: String,
}

/// Verdict of collecting a finished run's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    Done,
    Killed,
}

/// Materializes input artifacts into the working directory.
pub trait InputWriter {
    /// Write the input artifact(s). `inputs` carries everything pulled from
    /// producer stages, keyed by channel.
    fn write_input(&mut self, workdir: &Path, inputs: &ResolvedInputs) -> Result<()>;

    /// Apply the corrective change for the given attempt index before the
    /// input is regenerated. Must be a pure function of prior state: replaying
    /// attempts `0..n` after a restart reproduces the same configuration.
    fn remediate(&mut self, attempt: u32) -> Result<()>;

    /// Input artifact names relative to the working directory, used when
    /// archiving a killed attempt.
    fn input_artifacts(&self) -> Vec<PathBuf>;
}

/// Stages execution commands and answers queue-status questions.
pub trait JobRunner {
    /// Report `Running` if any of the stage's queue ids is still alive.
    fn check_status(&mut self, queue_ids: &[String]) -> QueueState;

    /// Stage the execution command for the next bundling pass. Replaces any
    /// previously pending command set, so repeated ticks are idempotent.
    fn enqueue(&mut self, command: String);

    /// Commands currently staged for submission, in execution order.
    fn pending_commands(&self) -> &[String];

    /// Drop the staged commands (called once a bundle submission succeeds).
    fn clear_pending(&mut self);
}

/// Parses completed output and publishes per-channel artifact sets.
pub trait OutputReader {
    /// Inspect the output artifact; `Done` on a recognized success marker,
    /// `Killed` when the run ended without one.
    fn collect(&mut self, workdir: &Path) -> Result<CollectOutcome>;

    /// True once a `collect` call returned `Done`.
    fn completed(&self) -> bool;

    /// Deterministic channel table: channel -> artifact names relative to the
    /// working directory. Same channel, same paths, on every call.
    fn exports(&self) -> &BTreeMap<String, ArtifactSet>;

    /// Name of the output artifact relative to the working directory. Its
    /// existence distinguishes "never ran" from "ran, not yet collected".
    fn output_artifact(&self) -> PathBuf;
}
