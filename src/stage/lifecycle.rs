// src/stage/lifecycle.rs

//! The stage state machine.
//!
//! One [`Stage`] wraps one writer/runner/reader triple, owns one working
//! directory, and advances one step per tick: materialize input, stage the
//! execution command, or collect output. Progress is derived from on-disk
//! artifacts and the checkpoint, never from in-memory-only state, so
//! `advance()` is safe to repeat and safe to resume after the driving process
//! is killed and restarted.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::checkpoint::{reconcile, store};
use crate::errors::{OrchestratorError, Result};
use crate::queue::QueueState;
use crate::stage::record::{
    CORE_SAFE_FIELDS, SKIP_FIELDS, StageRecord, StageReport, StageSpec, StageState,
};
use crate::stage::roles::{
    ArtifactSet, CollectOutcome, InputWriter, JobRunner, Need, OutputReader, ResolvedInputs,
};

/// Identity and wiring for a stage, separate from its backend spec.
#[derive(Debug, Clone)]
pub struct StageDef {
    pub name: String,
    pub workdir: PathBuf,
    pub nodes: u32,
    /// Execution command staged for the shared allocation.
    pub command: String,
    /// Pull dependencies on producer stages.
    pub needs: Vec<Need>,
}

/// Result of asking a producer for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    /// Absolute artifact paths, stable across calls once produced.
    Ready(ArtifactSet),
    /// Producer has not completed; caller's tick makes no progress on this
    /// channel.
    NotReady,
}

/// One lifecycle-managed calculation step.
#[derive(Debug)]
pub struct Stage<W, R, D> {
    record: StageRecord,
    writer: W,
    runner: R,
    reader: D,
    command: String,
}

impl<W, R, D> Stage<W, R, D>
where
    W: InputWriter,
    R: JobRunner,
    D: OutputReader,
{
    /// Construct a stage, reconciling against any checkpoint already in the
    /// working directory.
    ///
    /// If a checkpoint exists, the reconciled record (persisted fields merged
    /// with safe drift from the request) becomes the live stage; unsafe drift
    /// aborts with `ConfigConflict` before anything on disk changes. If no
    /// checkpoint exists one is persisted immediately, so a second
    /// construction in the same directory observes a consistent start.
    pub fn new<S: StageSpec>(
        def: StageDef,
        spec: &S,
        writer: W,
        runner: R,
        reader: D,
    ) -> Result<Self> {
        fs::create_dir_all(&def.workdir).map_err(|e| OrchestratorError::ArtifactIo {
            path: def.workdir.clone(),
            source: e,
        })?;

        let requested = StageRecord::new::<S>(&def.name, &def.workdir, def.nodes, &def.needs, spec)?;
        let path = requested.checkpoint_path();

        let record = if path.exists() {
            let persisted = store::load(&path)?;
            let safe = safe_fields::<S>();
            let (merged, changed) = reconcile::reconcile(
                &store::record_to_table(&persisted)?,
                &store::record_to_table(&requested)?,
                &safe,
                SKIP_FIELDS,
                &def.name,
            )?;
            let mut record = store::record_from_table(merged)?;
            if changed {
                info!(
                    stage = %def.name,
                    "safe configuration drift accepted; input will be regenerated"
                );
                record.writer_done = false;
                store::save(&record)?;
            } else {
                debug!(stage = %def.name, "resuming from checkpoint");
            }
            record
        } else {
            store::save(&requested)?;
            requested
        };

        let mut stage = Self {
            record,
            writer,
            runner,
            reader,
            command: def.command,
        };

        // Replay remediations so the writer matches the persisted attempt
        // count. Remediation is a pure function of prior state, so the replay
        // reproduces the exact configuration of the last attempt.
        for attempt in 0..stage.record.restart_count {
            stage.writer.remediate(attempt)?;
        }

        Ok(stage)
    }

    pub fn record(&self) -> &StageRecord {
        &self.record
    }

    pub fn needs(&self) -> &[Need] {
        &self.record.needs
    }

    /// Derived lifecycle position, in spec order: collected output wins, then
    /// a live queue entry, then the presence of the output artifact.
    pub fn poll_state(&mut self) -> StageState {
        if self.record.reader_done || self.reader.completed() {
            return StageState::Done;
        }
        if self.runner.check_status(&self.record.queue_ids) == QueueState::Running {
            return StageState::Running;
        }
        if !self
            .record
            .workdir
            .join(self.reader.output_artifact())
            .exists()
        {
            return StageState::NotStarted;
        }
        StageState::ReadyForAnalysis
    }

    /// One tick of the lifecycle.
    ///
    /// `inputs` carries everything the job pulled from producer stages for
    /// this tick; `max_retries` bounds how many killed runs may be remediated
    /// before the stage turns terminally failed. A checkpoint is persisted
    /// after every invocation regardless of the branch taken.
    pub fn advance(&mut self, inputs: &ResolvedInputs, max_retries: u32) -> Result<()> {
        if self.record.failed {
            debug!(stage = %self.record.name, "stage is terminally failed; advance is a no-op");
            return Ok(());
        }

        let outcome = self.advance_inner(inputs, max_retries);
        // Crash-consistency boundary.
        store::save(&self.record)?;
        outcome
    }

    fn advance_inner(&mut self, inputs: &ResolvedInputs, max_retries: u32) -> Result<()> {
        if !self.record.writer_done {
            self.writer.write_input(&self.record.workdir, inputs)?;
            self.record.writer_done = true;
            debug!(stage = %self.record.name, "input artifacts materialized");
        }

        match self.poll_state() {
            StageState::Done => {
                // Reader already holds a collected result (e.g. collected
                // earlier in this process); make the flag reflect it.
                self.record.reader_done = true;
            }
            StageState::Running => {
                debug!(stage = %self.record.name, "external run still alive");
            }
            StageState::NotStarted => {
                self.runner.enqueue(self.command.clone());
                debug!(
                    stage = %self.record.name,
                    command = %self.command,
                    "execution command staged for bundling"
                );
            }
            StageState::ReadyForAnalysis => match self.reader.collect(&self.record.workdir)? {
                CollectOutcome::Done => {
                    self.record.reader_done = true;
                    self.record.remediation_active = false;
                    info!(stage = %self.record.name, "output collected");
                }
                CollectOutcome::Killed => self.recover(max_retries)?,
            },
        }

        Ok(())
    }

    /// Bounded recovery from a killed run: archive the attempt, remediate the
    /// writer's configuration, and mark the input for regeneration. Exceeding
    /// the budget turns the stage terminally failed instead of looping.
    fn recover(&mut self, max_retries: u32) -> Result<()> {
        if self.record.restart_count >= max_retries {
            self.record.failed = true;
            warn!(
                stage = %self.record.name,
                attempts = self.record.restart_count,
                "remediation budget exhausted; marking stage failed"
            );
            return Ok(());
        }

        self.archive_attempt()?;
        self.writer.remediate(self.record.restart_count)?;
        self.record.writer_done = false;
        self.record.restart_count += 1;
        self.record.remediation_active = true;
        warn!(
            stage = %self.record.name,
            attempt = self.record.restart_count,
            "run was killed; input remediated for resubmission"
        );
        Ok(())
    }

    /// Move the current input/output artifacts under `attempt-<n>/` so the
    /// failed run stays inspectable.
    fn archive_attempt(&self) -> Result<()> {
        let dir = self
            .record
            .workdir
            .join(format!("attempt-{}", self.record.restart_count));
        fs::create_dir_all(&dir).map_err(|e| OrchestratorError::ArtifactIo {
            path: dir.clone(),
            source: e,
        })?;

        let mut artifacts = self.writer.input_artifacts();
        artifacts.push(self.reader.output_artifact());
        for rel in artifacts {
            let src = self.record.workdir.join(&rel);
            if !src.exists() {
                continue;
            }
            let dst = dir.join(rel.file_name().unwrap_or(rel.as_os_str()));
            fs::rename(&src, &dst).map_err(|e| OrchestratorError::ArtifactIo {
                path: src.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Hand out the artifact set for one channel.
    ///
    /// `NotReady` until the stage completes; a completed stage that never
    /// produced the channel is a hard error. Paths are deterministic: same
    /// channel, same paths, every call.
    pub fn export(&self, channel: &str) -> Result<Export> {
        if !self.record.completed() {
            return Ok(Export::NotReady);
        }
        match self.reader.exports().get(channel) {
            Some(set) => Ok(Export::Ready(
                set.iter().map(|p| self.record.workdir.join(p)).collect(),
            )),
            None => Err(OrchestratorError::MissingChannel {
                producer: self.record.name.clone(),
                channel: channel.to_string(),
            }),
        }
    }

    /// Record the external job id a bundle submission returned and drop the
    /// staged commands. Persists the checkpoint like `advance()` does.
    pub fn update_queue_id(&mut self, id: &str) -> Result<()> {
        self.record.queue_ids.push(id.to_string());
        self.runner.clear_pending();
        store::save(&self.record)
    }

    /// Explicit configuration update: reconcile a newly requested spec
    /// against the live record.
    ///
    /// Returns whether any safe field changed (in which case the input is
    /// marked for regeneration and the checkpoint re-persisted). Unsafe drift
    /// aborts with `ConfigConflict` and leaves the record untouched.
    pub fn update_spec<S: StageSpec>(&mut self, nodes: u32, spec: &S) -> Result<bool> {
        let mut requested = self.record.clone();
        requested.nodes = nodes;
        requested.spec =
            toml::Value::try_from(spec).map_err(|e| OrchestratorError::Checkpoint {
                path: self.record.checkpoint_path(),
                reason: format!("serializing stage spec: {e}"),
            })?;

        let safe = safe_fields::<S>();
        let (merged, changed) = reconcile::reconcile(
            &store::record_to_table(&self.record)?,
            &store::record_to_table(&requested)?,
            &safe,
            SKIP_FIELDS,
            &self.record.name,
        )?;

        if changed {
            let mut record = store::record_from_table(merged)?;
            record.writer_done = false;
            store::save(&record)?;
            self.record = record;
            info!(stage = %self.record.name, "configuration updated; input will be regenerated");
        }
        Ok(changed)
    }

    /// Caller-facing status: `Ok` when complete, `Retry` while remediation is
    /// active with budget remaining, `Failed` once the budget is exhausted.
    pub fn report(&self) -> StageReport {
        if self.record.completed() {
            StageReport::Ok
        } else if self.record.failed {
            StageReport::Failed
        } else if self.record.remediation_active {
            StageReport::Retry
        } else {
            StageReport::NotFinished
        }
    }
}

/// Object-safe facade so a job can hold stages of different backend kinds.
pub trait StageHandle {
    fn record(&self) -> &StageRecord;
    fn needs(&self) -> &[Need];
    fn report(&self) -> StageReport;
    fn poll_state(&mut self) -> StageState;
    fn advance(&mut self, inputs: &ResolvedInputs, max_retries: u32) -> Result<()>;
    fn export(&self, channel: &str) -> Result<Export>;
    fn pending_commands(&self) -> Vec<String>;
    fn update_queue_id(&mut self, id: &str) -> Result<()>;
}

impl<W, R, D> StageHandle for Stage<W, R, D>
where
    W: InputWriter,
    R: JobRunner,
    D: OutputReader,
{
    fn record(&self) -> &StageRecord {
        Stage::record(self)
    }

    fn needs(&self) -> &[Need] {
        Stage::needs(self)
    }

    fn report(&self) -> StageReport {
        Stage::report(self)
    }

    fn poll_state(&mut self) -> StageState {
        Stage::poll_state(self)
    }

    fn advance(&mut self, inputs: &ResolvedInputs, max_retries: u32) -> Result<()> {
        Stage::advance(self, inputs, max_retries)
    }

    fn export(&self, channel: &str) -> Result<Export> {
        Stage::export(self, channel)
    }

    fn pending_commands(&self) -> Vec<String> {
        self.runner.pending_commands().to_vec()
    }

    fn update_queue_id(&mut self, id: &str) -> Result<()> {
        Stage::update_queue_id(self, id)
    }
}

/// Full allow-list for a stage kind: the core's safe fields plus the spec's
/// own, under the `spec.` prefix.
fn safe_fields<S: StageSpec>() -> Vec<String> {
    CORE_SAFE_FIELDS
        .iter()
        .map(|s| s.to_string())
        .chain(S::SAFE_FIELDS.iter().map(|s| format!("spec.{s}")))
        .collect()
}
