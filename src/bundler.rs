// src/bundler.rs

//! Resource-aware bundling of ready stages into shared allocations.
//!
//! Packing is greedy first-fit-in-order: input order is preserved, a running
//! node sum is kept, and a bundle is closed whenever the next stage would
//! exceed capacity. Deliberately not optimal bin packing, so unrelated jobs
//! are never reordered and a given input always packs the same way. The
//! bundler only reads declared node requirements and writes queue ids back;
//! it never touches a stage's artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::model::BundleSection;
use crate::errors::{OrchestratorError, Result};
use crate::queue::BatchQueue;
use crate::stage::lifecycle::StageHandle;

/// One shared batch-submission unit, transient per bundling pass. Members
/// index into the slice handed to [`Bundler::submit_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub members: Vec<usize>,
    pub nodes: u32,
}

/// Pack node requirements into capacity-bounded bundles.
///
/// A single requirement above capacity gets its own oversized bundle rather
/// than being rejected; the queue is the authority on whether it can run.
pub fn pack(requirements: &[u32], capacity: u32) -> Vec<Bundle> {
    let mut bundles = Vec::new();
    let mut members: Vec<usize> = Vec::new();
    let mut total = 0u32;

    for (idx, &nodes) in requirements.iter().enumerate() {
        if !members.is_empty() && total + nodes > capacity {
            bundles.push(Bundle {
                members: std::mem::take(&mut members),
                nodes: total,
            });
            total = 0;
        }
        members.push(idx);
        total += nodes;
    }
    if !members.is_empty() {
        bundles.push(Bundle { members, nodes: total });
    }
    bundles
}

/// Groups ready stages across jobs and fans the returned queue id back to
/// every member.
pub struct Bundler {
    section: BundleSection,
    queue: Box<dyn BatchQueue>,
    /// Feeds bundle names. Names whose script already exists in the script
    /// directory are skipped, so a restarted driver never overwrites the
    /// rendered script of an earlier lifetime's bundle.
    counter: u64,
}

impl Bundler {
    pub fn new(section: BundleSection, queue: Box<dyn BatchQueue>) -> Self {
        Self {
            section,
            queue,
            counter: 0,
        }
    }

    /// Submit every stage in bundles.
    ///
    /// On a successful submission the external job id is broadcast to every
    /// member via `update_queue_id()`, which also drops their staged
    /// commands. On a failed submission no member is mutated; the same stages
    /// simply show up again on the next bundling pass.
    pub fn submit_all(&mut self, stages: &mut [&mut Box<dyn StageHandle>]) -> Result<()> {
        if stages.is_empty() {
            return Ok(());
        }

        let requirements: Vec<u32> = stages.iter().map(|s| s.record().nodes).collect();
        let bundles = pack(&requirements, self.section.capacity_nodes);
        debug!(
            stages = stages.len(),
            bundles = bundles.len(),
            capacity = self.section.capacity_nodes,
            "bundling pass"
        );

        for bundle in bundles {
            let jobname = self.next_jobname();

            match self.submit_bundle(stages, &bundle, &jobname) {
                Ok(id) => {
                    for &member in bundle.members.iter() {
                        stages[member].update_queue_id(&id)?;
                    }
                    info!(
                        jobname,
                        queue_id = %id,
                        members = bundle.members.len(),
                        nodes = bundle.nodes,
                        "bundle submitted"
                    );
                }
                Err(err) if err.is_retryable() => {
                    warn!(jobname, error = %err, "bundle submission failed; will retry next pass");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Next unused bundle name: rendered scripts stay inspectable like
    /// archived attempts, so an existing `.qsub` is never reclaimed.
    fn next_jobname(&mut self) -> String {
        let dir = Path::new(&self.section.script_dir);
        loop {
            let jobname = format!("{}_{}", self.section.jobname, self.counter);
            self.counter += 1;
            if !dir.join(format!("{jobname}.qsub")).exists() {
                return jobname;
            }
        }
    }

    fn submit_bundle(
        &mut self,
        stages: &[&mut Box<dyn StageHandle>],
        bundle: &Bundle,
        jobname: &str,
    ) -> Result<String> {
        let script = self.render_script(stages, bundle, jobname);

        let dir = PathBuf::from(&self.section.script_dir);
        fs::create_dir_all(&dir).map_err(|e| OrchestratorError::ArtifactIo {
            path: dir.clone(),
            source: e,
        })?;
        let path = dir.join(format!("{jobname}.qsub"));
        fs::write(&path, script).map_err(|e| OrchestratorError::ArtifactIo {
            path: path.clone(),
            source: e,
        })?;

        self.queue.submit(&path, jobname)
    }

    /// Render one PBS script concatenating every member's staged commands,
    /// each run from its own working directory.
    fn render_script(
        &self,
        stages: &[&mut Box<dyn StageHandle>],
        bundle: &Bundle,
        jobname: &str,
    ) -> String {
        let mut lines = vec![
            format!("#PBS -q {}", self.section.queue),
            format!(
                "#PBS -l nodes={}:ppn={}",
                bundle.nodes, self.section.ppn
            ),
            format!("#PBS -l walltime={}", self.section.walltime),
            "#PBS -j oe".to_string(),
        ];
        if let Some(account) = self.section.account.as_deref() {
            lines.push(format!("#PBS -A {account}"));
        }
        lines.push(format!("#PBS -N {jobname}"));
        lines.push(format!("#PBS -o {jobname}.out"));
        lines.extend(self.section.prologue.iter().cloned());

        for &member in bundle.members.iter() {
            let stage = &stages[member];
            lines.push(format!("cd {}", stage.record().workdir.display()));
            lines.extend(stage.pending_commands());
        }

        lines.push("wait".to_string());
        lines.extend(self.section.epilogue.iter().cloned());
        lines.push(String::new());
        lines.join("\n")
    }
}
