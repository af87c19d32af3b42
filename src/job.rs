// src/job.rs

//! Job container and pull-based dependency resolution.
//!
//! A job is an ordered sequence of stages forming one calculation pipeline.
//! `tick()` advances every stage once; when a consumer declares needs, the
//! job pulls the exports first, advancing an incomplete producer exactly one
//! hop. Ticking stages in any stable order converges, because each stage
//! either makes forward progress or is blocked strictly on an upstream stage
//! that itself makes progress.

use tracing::debug;

use crate::errors::{OrchestratorError, Result};
use crate::stage::lifecycle::{Export, StageHandle};
use crate::stage::record::{StageReport, StageState};
use crate::stage::roles::{Need, ResolvedInputs};

/// Caller-facing status of a whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobReport {
    /// Every stage completed.
    Ok,
    /// At least one stage is still working or waiting.
    NotFinished,
    /// At least one stage exhausted its remediation budget.
    Failed,
}

/// One calculation pipeline: an identifier plus its ordered stages.
pub struct Job {
    id: String,
    stages: Vec<Box<dyn StageHandle>>,
    max_retries: u32,
}

impl Job {
    pub fn new(id: impl Into<String>, stages: Vec<Box<dyn StageHandle>>, max_retries: u32) -> Self {
        Self {
            id: id.into(),
            stages,
            max_retries,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stages(&self) -> &[Box<dyn StageHandle>] {
        &self.stages
    }

    /// Advance every stage once, in declared order.
    ///
    /// A stage pulled forward by a downstream consumer earlier in the cycle
    /// is not advanced a second time; a consumer whose needs are not all
    /// ready makes no progress this tick.
    pub fn tick(&mut self) -> Result<()> {
        let mut advanced = vec![false; self.stages.len()];

        for i in 0..self.stages.len() {
            if advanced[i] {
                continue;
            }
            if matches!(self.stages[i].report(), StageReport::Ok | StageReport::Failed) {
                continue;
            }

            match self.resolve_inputs(i, &mut advanced)? {
                Some(inputs) => {
                    advanced[i] = true;
                    self.stages[i].advance(&inputs, self.max_retries)?;
                }
                None => {
                    debug!(
                        job = %self.id,
                        stage = %self.stages[i].record().name,
                        "blocked on upstream exports this tick"
                    );
                }
            }
        }

        Ok(())
    }

    /// Resolve one export on demand: the dependency edge is never stored,
    /// only answered.
    ///
    /// An incomplete producer is advanced exactly once (single hop, no
    /// cascade) and the call returns `NotReady`; a completed producer either
    /// yields its stable artifact set or fails with `MissingChannel`.
    pub fn pull(&mut self, need: &Need) -> Result<Export> {
        let mut advanced = vec![false; self.stages.len()];
        self.pull_at(need, &mut advanced)
    }

    /// Gather everything stage `consumer` needs for this tick. Pulls every
    /// producer even once blocked, so each of them gets its hop of progress.
    fn resolve_inputs(
        &mut self,
        consumer: usize,
        advanced: &mut [bool],
    ) -> Result<Option<ResolvedInputs>> {
        let needs = self.stages[consumer].needs().to_vec();
        let mut inputs = ResolvedInputs::new();
        let mut blocked = false;

        for need in needs {
            match self.pull_at(&need, advanced)? {
                Export::Ready(set) => {
                    inputs.insert(need.channel.clone(), set);
                }
                Export::NotReady => blocked = true,
            }
        }

        Ok(if blocked { None } else { Some(inputs) })
    }

    fn pull_at(&mut self, need: &Need, advanced: &mut [bool]) -> Result<Export> {
        let producer =
            self.index_of(&need.producer)
                .ok_or_else(|| OrchestratorError::MissingChannel {
                    producer: need.producer.clone(),
                    channel: need.channel.clone(),
                })?;

        if !self.stages[producer].record().completed() {
            let may_advance =
                !advanced[producer] && !matches!(self.stages[producer].report(), StageReport::Failed);
            if may_advance {
                // Single hop: the producer's own inputs come from already
                // completed grand-producers only; nothing further upstream is
                // advanced within this pull.
                if let Some(inputs) = self.peek_inputs(producer)? {
                    advanced[producer] = true;
                    self.stages[producer].advance(&inputs, self.max_retries)?;
                }
            }
            if !self.stages[producer].record().completed() {
                return Ok(Export::NotReady);
            }
        }

        self.stages[producer].export(&need.channel)
    }

    /// Resolve a stage's needs without advancing anything: `None` unless all
    /// of its producers already completed.
    fn peek_inputs(&self, idx: usize) -> Result<Option<ResolvedInputs>> {
        let mut inputs = ResolvedInputs::new();
        for need in self.stages[idx].needs().to_vec() {
            let producer =
                self.index_of(&need.producer)
                    .ok_or_else(|| OrchestratorError::MissingChannel {
                        producer: need.producer.clone(),
                        channel: need.channel.clone(),
                    })?;
            if !self.stages[producer].record().completed() {
                return Ok(None);
            }
            match self.stages[producer].export(&need.channel)? {
                Export::Ready(set) => {
                    inputs.insert(need.channel.clone(), set);
                }
                Export::NotReady => return Ok(None),
            }
        }
        Ok(Some(inputs))
    }

    /// Stages ready for the bundler: not started, with a staged command.
    pub fn submittable(&mut self) -> Vec<&mut Box<dyn StageHandle>> {
        self.stages
            .iter_mut()
            .filter_map(|stage| {
                let ready = !matches!(stage.report(), StageReport::Failed)
                    && matches!(stage.poll_state(), StageState::NotStarted)
                    && !stage.pending_commands().is_empty();
                ready.then_some(stage)
            })
            .collect()
    }

    pub fn report(&self) -> JobReport {
        let mut all_ok = true;
        for stage in self.stages.iter() {
            match stage.report() {
                StageReport::Failed => return JobReport::Failed,
                StageReport::Ok => {}
                StageReport::Retry | StageReport::NotFinished => all_ok = false,
            }
        }
        if all_ok { JobReport::Ok } else { JobReport::NotFinished }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.record().name == name)
    }
}
