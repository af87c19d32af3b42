// src/config/validate.rs

use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{JobConfig, WorkflowFile};

/// Run semantic validation against a loaded workflow.
///
/// This checks:
/// - there is at least one job, and every job has at least one stage
/// - `[bundle].capacity_nodes >= 1` and `[settings].poll_interval_secs >= 1`
/// - stage names are unique within a job
/// - every `needs` entry refers to an existing, distinct stage and no two
///   entries of one stage pull the same channel name
/// - every declared node requirement is `>= 1`
/// - the per-job dependency graph has no cycles
///
/// It does **not** compile the `done_marker` / `killed_marker` regexes; those
/// are validated when the backend readers are built.
pub fn validate_workflow(cfg: &WorkflowFile) -> Result<()> {
    ensure_has_jobs(cfg)?;
    validate_globals(cfg)?;
    for (id, job) in cfg.job.iter() {
        validate_job(id, job)?;
    }
    Ok(())
}

fn ensure_has_jobs(cfg: &WorkflowFile) -> Result<()> {
    if cfg.job.is_empty() {
        return Err(anyhow!("workflow must contain at least one [job.<id>] section"));
    }
    for (id, job) in cfg.job.iter() {
        if job.stages.is_empty() {
            return Err(anyhow!("job '{}' has no [[job.{}.stage]] entries", id, id));
        }
    }
    Ok(())
}

fn validate_globals(cfg: &WorkflowFile) -> Result<()> {
    if cfg.bundle.capacity_nodes == 0 {
        return Err(anyhow!("[bundle].capacity_nodes must be >= 1 (got 0)"));
    }
    if cfg.settings.poll_interval_secs == 0 {
        return Err(anyhow!("[settings].poll_interval_secs must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_job(id: &str, job: &JobConfig) -> Result<()> {
    let mut seen = BTreeSet::new();
    for stage in job.stages.iter() {
        if !seen.insert(stage.name.as_str()) {
            return Err(anyhow!(
                "job '{}' declares stage '{}' more than once",
                id,
                stage.name
            ));
        }
        if stage.nodes == 0 {
            return Err(anyhow!(
                "stage '{}' in job '{}' must request at least one node",
                stage.name,
                id
            ));
        }
    }

    for stage in job.stages.iter() {
        let mut channels = BTreeSet::new();
        for need in stage.needs.iter() {
            if !seen.contains(need.stage.as_str()) {
                return Err(anyhow!(
                    "stage '{}' in job '{}' needs unknown producer '{}'",
                    stage.name,
                    id,
                    need.stage
                ));
            }
            if need.stage == stage.name {
                return Err(anyhow!(
                    "stage '{}' in job '{}' cannot pull from itself",
                    stage.name,
                    id
                ));
            }
            if !channels.insert(need.channel.as_str()) {
                return Err(anyhow!(
                    "stage '{}' in job '{}' pulls channel '{}' more than once",
                    stage.name,
                    id,
                    need.channel
                ));
            }
        }
    }

    validate_dag(id, job)
}

fn validate_dag(id: &str, job: &JobConfig) -> Result<()> {
    // Edge direction: producer -> consumer. A topological sort fails exactly
    // when the pull graph has a cycle, in which case no tick order converges.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for stage in job.stages.iter() {
        graph.add_node(stage.name.as_str());
    }
    for stage in job.stages.iter() {
        for need in stage.needs.iter() {
            graph.add_edge(need.stage.as_str(), stage.name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(anyhow!(
            "cycle detected in dependency graph of job '{}' involving stage '{}'",
            id,
            cycle.node_id()
        )),
    }
}
