// src/backend/script.rs

//! The generic script backend.
//!
//! - [`ScriptWriter`] renders configured lines into the input artifact,
//!   substituting `{channel}` placeholders with pulled producer artifacts and
//!   appending remediation lines once per recovery attempt.
//! - [`QueueRunner`] stages the execution command for the bundler and answers
//!   status questions through a [`BatchQueue`] client.
//! - [`MarkerReader`] decides done-vs-killed from regex markers in the output
//!   and publishes the configured per-channel artifact sets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::model::StageConfig;
use crate::errors::{OrchestratorError, Result};
use crate::queue::{BatchQueue, QueueState};
use crate::stage::lifecycle::{Stage, StageDef, StageHandle};
use crate::stage::record::StageSpec;
use crate::stage::roles::{
    ArtifactSet, CollectOutcome, InputWriter, JobRunner, Need, OutputReader, ResolvedInputs,
};

/// The persisted configuration record of a script stage.
///
/// Fields not in `SAFE_FIELDS` describe the physical calculation; drift on
/// them aborts reconciliation instead of silently changing a long-running
/// campaign.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptSpec {
    pub command: String,
    pub input_file: String,
    pub output_file: String,
    pub input_lines: Vec<String>,
    pub retry_lines: Vec<String>,
    pub done_marker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed_marker: Option<String>,
    pub exports: BTreeMap<String, Vec<String>>,
    pub prologue: Vec<String>,
    pub epilogue: Vec<String>,
}

impl StageSpec for ScriptSpec {
    const KIND: &'static str = "script";

    // Markers and remediation tweaks do not alter the calculation itself.
    const SAFE_FIELDS: &'static [&'static str] = &["retry_lines", "done_marker", "killed_marker"];
}

impl ScriptSpec {
    pub fn from_config(cfg: &StageConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            input_file: cfg.input_file.clone(),
            output_file: cfg.output_file.clone(),
            input_lines: cfg.input_lines.clone(),
            retry_lines: cfg.retry_lines.clone(),
            done_marker: cfg.done_marker.clone(),
            killed_marker: cfg.killed_marker.clone(),
            exports: cfg.exports.clone(),
            prologue: cfg.prologue.clone(),
            epilogue: cfg.epilogue.clone(),
        }
    }
}

/// Renders configured lines into the input artifact.
pub struct ScriptWriter {
    input_file: PathBuf,
    base_lines: Vec<String>,
    retry_lines: Vec<String>,
    /// Recovery attempts applied so far; the retry lines are appended once
    /// per attempt.
    attempts: u32,
}

impl ScriptWriter {
    pub fn new(input_file: &str, base_lines: Vec<String>, retry_lines: Vec<String>) -> Self {
        Self {
            input_file: PathBuf::from(input_file),
            base_lines,
            retry_lines,
            attempts: 0,
        }
    }
}

impl InputWriter for ScriptWriter {
    fn write_input(&mut self, workdir: &Path, inputs: &ResolvedInputs) -> Result<()> {
        let mut lines: Vec<String> = self
            .base_lines
            .iter()
            .map(|l| substitute(l, inputs))
            .collect();
        for _ in 0..self.attempts {
            lines.extend(self.retry_lines.iter().map(|l| substitute(l, inputs)));
        }

        let path = workdir.join(&self.input_file);
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).map_err(|e| OrchestratorError::ArtifactIo {
            path: path.clone(),
            source: e,
        })?;
        debug!(input = ?path, attempts = self.attempts, "input artifact written");
        Ok(())
    }

    fn remediate(&mut self, attempt: u32) -> Result<()> {
        // Pure function of prior state: applying attempts 0..n in order
        // always yields the same configuration, which is what lets the stage
        // replay remediations after a driver restart.
        self.attempts = self.attempts.max(attempt + 1);
        Ok(())
    }

    fn input_artifacts(&self) -> Vec<PathBuf> {
        vec![self.input_file.clone()]
    }
}

/// Replace `{channel}` placeholders with the pulled artifact paths for that
/// channel, space-joined.
fn substitute(line: &str, inputs: &ResolvedInputs) -> String {
    let mut out = line.to_string();
    for (channel, paths) in inputs.iter() {
        let needle = format!("{{{channel}}}");
        if out.contains(&needle) {
            let joined = paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            out = out.replace(&needle, &joined);
        }
    }
    out
}

/// Stages commands for the bundler and polls the batch queue.
pub struct QueueRunner {
    queue: Box<dyn BatchQueue>,
    prologue: Vec<String>,
    epilogue: Vec<String>,
    pending: Vec<String>,
}

impl QueueRunner {
    pub fn new(queue: Box<dyn BatchQueue>, prologue: Vec<String>, epilogue: Vec<String>) -> Self {
        Self {
            queue,
            prologue,
            epilogue,
            pending: Vec::new(),
        }
    }
}

impl JobRunner for QueueRunner {
    fn check_status(&mut self, queue_ids: &[String]) -> QueueState {
        if queue_ids.is_empty() {
            return QueueState::Unknown;
        }
        self.queue.poll(queue_ids)
    }

    fn enqueue(&mut self, command: String) {
        self.pending.clear();
        self.pending.extend(self.prologue.iter().cloned());
        self.pending.push(command);
        self.pending.extend(self.epilogue.iter().cloned());
    }

    fn pending_commands(&self) -> &[String] {
        &self.pending
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

/// Scans the output artifact for markers and publishes configured exports.
pub struct MarkerReader {
    output_file: PathBuf,
    done: Regex,
    killed: Option<Regex>,
    exports: BTreeMap<String, ArtifactSet>,
    completed: bool,
}

impl MarkerReader {
    pub fn new(
        output_file: &str,
        done_marker: &str,
        killed_marker: Option<&str>,
        exports: &BTreeMap<String, Vec<String>>,
    ) -> anyhow::Result<Self> {
        let done = Regex::new(done_marker)
            .with_context(|| format!("compiling done_marker regex {done_marker:?}"))?;
        let killed = killed_marker
            .map(|m| Regex::new(m).with_context(|| format!("compiling killed_marker regex {m:?}")))
            .transpose()?;
        let exports = exports
            .iter()
            .map(|(channel, files)| {
                (
                    channel.clone(),
                    files.iter().map(PathBuf::from).collect::<ArtifactSet>(),
                )
            })
            .collect();
        Ok(Self {
            output_file: PathBuf::from(output_file),
            done,
            killed,
            exports,
            completed: false,
        })
    }
}

impl OutputReader for MarkerReader {
    fn collect(&mut self, workdir: &Path) -> Result<CollectOutcome> {
        let path = workdir.join(&self.output_file);
        let contents = fs::read_to_string(&path).map_err(|e| OrchestratorError::ArtifactIo {
            path: path.clone(),
            source: e,
        })?;

        if contents.lines().any(|line| self.done.is_match(line)) {
            self.completed = true;
            return Ok(CollectOutcome::Done);
        }

        // Finished without a success marker: killed either way, but an
        // explicit failure marker is worth calling out.
        if let Some(killed) = self.killed.as_ref() {
            if contents.lines().any(|line| killed.is_match(line)) {
                warn!(output = ?path, "explicit failure marker found in output");
            }
        }
        Ok(CollectOutcome::Killed)
    }

    fn completed(&self) -> bool {
        self.completed
    }

    fn exports(&self) -> &BTreeMap<String, ArtifactSet> {
        &self.exports
    }

    fn output_artifact(&self) -> PathBuf {
        self.output_file.clone()
    }
}

/// Build one script stage from its workflow entry.
///
/// The stage's working directory defaults to `<job workdir>/<name>`; relative
/// overrides resolve against the job workdir.
pub fn build_stage(
    job_workdir: &Path,
    cfg: &StageConfig,
    queue: Box<dyn BatchQueue>,
) -> anyhow::Result<Box<dyn StageHandle>> {
    let spec = ScriptSpec::from_config(cfg);

    let workdir = match cfg.workdir.as_deref() {
        Some(dir) => {
            let p = PathBuf::from(dir);
            if p.is_absolute() { p } else { job_workdir.join(p) }
        }
        None => job_workdir.join(&cfg.name),
    };

    let writer = ScriptWriter::new(&cfg.input_file, cfg.input_lines.clone(), cfg.retry_lines.clone());
    let runner = QueueRunner::new(queue, cfg.prologue.clone(), cfg.epilogue.clone());
    let reader = MarkerReader::new(
        &cfg.output_file,
        &cfg.done_marker,
        cfg.killed_marker.as_deref(),
        &cfg.exports,
    )
    .with_context(|| format!("building reader for stage '{}'", cfg.name))?;

    let def = StageDef {
        name: cfg.name.clone(),
        workdir,
        nodes: cfg.nodes,
        command: cfg.command.clone(),
        needs: cfg
            .needs
            .iter()
            .map(|n| Need {
                producer: n.stage.clone(),
                channel: n.channel.clone(),
            })
            .collect(),
    };

    let stage = Stage::new(def, &spec, writer, runner, reader)
        .with_context(|| format!("constructing stage '{}'", cfg.name))?;
    Ok(Box::new(stage))
}
