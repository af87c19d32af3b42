#![allow(dead_code)]

//! Shared fakes for integration tests: an in-memory writer/runner/reader
//! triple with scripted queue behaviour, plus a scripted batch queue for
//! bundler tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;

use stagehand::errors::{OrchestratorError, Result};
use stagehand::queue::{BatchQueue, QueueState};
use stagehand::stage::{
    ArtifactSet, CollectOutcome, InputWriter, JobRunner, Need, OutputReader, ResolvedInputs,
    Stage, StageDef, StageSpec,
};

/// Minimal backend spec for tests. `tolerance` is allow-listed; `command`
/// is checked.
#[derive(Debug, Clone, Serialize)]
pub struct TestSpec {
    pub command: String,
    pub tolerance: f64,
}

impl StageSpec for TestSpec {
    const KIND: &'static str = "test";
    const SAFE_FIELDS: &'static [&'static str] = &["tolerance"];
}

#[derive(Clone, Debug)]
pub struct FakeWriter {
    pub input_file: PathBuf,
    pub writes: Rc<RefCell<u32>>,
    pub remediations: Rc<RefCell<Vec<u32>>>,
}

impl InputWriter for FakeWriter {
    fn write_input(&mut self, workdir: &Path, inputs: &ResolvedInputs) -> Result<()> {
        *self.writes.borrow_mut() += 1;
        let mut body = String::from("input\n");
        for (channel, paths) in inputs.iter() {
            let joined: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            body.push_str(&format!("{channel}: {}\n", joined.join(" ")));
        }
        let path = workdir.join(&self.input_file);
        fs::write(&path, body).map_err(|e| OrchestratorError::ArtifactIo { path, source: e })?;
        Ok(())
    }

    fn remediate(&mut self, attempt: u32) -> Result<()> {
        self.remediations.borrow_mut().push(attempt);
        Ok(())
    }

    fn input_artifacts(&self) -> Vec<PathBuf> {
        vec![self.input_file.clone()]
    }
}

#[derive(Clone, Debug)]
pub struct FakeRunner {
    pub state: Rc<RefCell<QueueState>>,
    pub polls: Rc<RefCell<u32>>,
    pub pending: Vec<String>,
}

impl JobRunner for FakeRunner {
    fn check_status(&mut self, _queue_ids: &[String]) -> QueueState {
        *self.polls.borrow_mut() += 1;
        *self.state.borrow()
    }

    fn enqueue(&mut self, command: String) {
        self.pending = vec![command];
    }

    fn pending_commands(&self) -> &[String] {
        &self.pending
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug)]
pub struct FakeReader {
    pub output_file: PathBuf,
    pub exports: BTreeMap<String, ArtifactSet>,
    pub completed: bool,
}

impl OutputReader for FakeReader {
    fn collect(&mut self, workdir: &Path) -> Result<CollectOutcome> {
        let path = workdir.join(&self.output_file);
        let contents =
            fs::read_to_string(&path).map_err(|e| OrchestratorError::ArtifactIo { path, source: e })?;
        if contents.contains("DONE") {
            self.completed = true;
            Ok(CollectOutcome::Done)
        } else {
            Ok(CollectOutcome::Killed)
        }
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

/// Scripted batch queue for bundler tests.
#[derive(Clone, Default)]
pub struct FakeQueue {
    pub submissions: Rc<RefCell<Vec<(PathBuf, String)>>>,
    pub next_id: Rc<RefCell<u64>>,
    pub fail: Rc<RefCell<bool>>,
}

impl BatchQueue for FakeQueue {
    fn submit(&mut self, script_path: &Path, jobname: &str) -> Result<String> {
        if *self.fail.borrow() {
            return Err(OrchestratorError::Submission("queue rejected bundle".into()));
        }
        self.submissions
            .borrow_mut()
            .push((script_path.to_path_buf(), jobname.to_string()));
        let mut next = self.next_id.borrow_mut();
        *next += 1;
        Ok(next.to_string())
    }

    fn poll(&mut self, _queue_ids: &[String]) -> QueueState {
        QueueState::Unknown
    }
}

/// A test stage plus handles into its fakes.
#[derive(Debug)]
pub struct TestStage {
    pub stage: Stage<FakeWriter, FakeRunner, FakeReader>,
    pub workdir: PathBuf,
    pub output_file: PathBuf,
    pub writes: Rc<RefCell<u32>>,
    pub polls: Rc<RefCell<u32>>,
    pub remediations: Rc<RefCell<Vec<u32>>>,
    pub queue_state: Rc<RefCell<QueueState>>,
}

pub struct StageOpts {
    pub nodes: u32,
    pub needs: Vec<Need>,
    pub exports: BTreeMap<String, ArtifactSet>,
    pub spec: TestSpec,
}

impl Default for StageOpts {
    fn default() -> Self {
        Self {
            nodes: 1,
            needs: Vec::new(),
            exports: BTreeMap::new(),
            spec: TestSpec {
                command: "run".into(),
                tolerance: 1e-6,
            },
        }
    }
}

pub fn exports(entries: &[(&str, &[&str])]) -> BTreeMap<String, ArtifactSet> {
    entries
        .iter()
        .map(|(channel, files)| {
            (
                channel.to_string(),
                files.iter().map(PathBuf::from).collect(),
            )
        })
        .collect()
}

/// Build a stage backed by fakes in `workdir/<name>`.
pub fn build_stage(root: &Path, name: &str, opts: StageOpts) -> Result<TestStage> {
    let workdir = root.join(name);
    let writes = Rc::new(RefCell::new(0));
    let polls = Rc::new(RefCell::new(0));
    let remediations = Rc::new(RefCell::new(Vec::new()));
    let queue_state = Rc::new(RefCell::new(QueueState::Unknown));
    let output_file = PathBuf::from(format!("{name}.out"));

    let writer = FakeWriter {
        input_file: PathBuf::from(format!("{name}.in")),
        writes: writes.clone(),
        remediations: remediations.clone(),
    };
    let runner = FakeRunner {
        state: queue_state.clone(),
        polls: polls.clone(),
        pending: Vec::new(),
    };
    let reader = FakeReader {
        output_file: output_file.clone(),
        exports: opts.exports,
        completed: false,
    };

    let def = StageDef {
        name: name.to_string(),
        workdir: workdir.clone(),
        nodes: opts.nodes,
        command: format!("run {name}"),
        needs: opts.needs,
    };
    let stage = Stage::new(def, &opts.spec, writer, runner, reader)?;

    Ok(TestStage {
        stage,
        workdir,
        output_file,
        writes,
        polls,
        remediations,
        queue_state,
    })
}

/// Drop a success-marked output artifact into the stage's working directory.
pub fn finish_run(workdir: &Path, output_file: &Path) {
    fs::write(workdir.join(output_file), "result 1.0\nDONE\n").unwrap();
}

/// Drop a killed (no success marker) output artifact.
pub fn kill_run(workdir: &Path, output_file: &Path) {
    fs::write(workdir.join(output_file), "walltime exceeded\n").unwrap();
}
