// src/lib.rs

pub mod backend;
pub mod bundler;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod errors;
pub mod job;
pub mod logging;
pub mod queue;
pub mod stage;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::bundler::Bundler;
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::WorkflowFile;
use crate::job::{Job, JobReport};
use crate::queue::PbsQueue;
use crate::stage::StageHandle;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - workflow loading + validation
/// - job/stage construction (reconciling against on-disk checkpoints)
/// - the tick loop: advance every job, then hand ready stages to the bundler
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let mut jobs = build_jobs(&cfg)?;
    let mut bundler = Bundler::new(cfg.bundle.clone(), Box::new(PbsQueue));

    let poll = args
        .poll_interval
        .unwrap_or(cfg.settings.poll_interval_secs)
        .max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(poll));

    info!(
        jobs = jobs.len(),
        poll_interval_secs = poll,
        "stagehand driver started"
    );

    loop {
        // The first interval tick fires immediately, so `--once` still does
        // one full cycle.
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested; already-submitted runs keep going");
                break;
            }
        }

        tick_cycle(&mut jobs, &mut bundler)?;

        let reports: Vec<JobReport> = jobs.iter().map(|j| j.report()).collect();
        let all_terminal = reports
            .iter()
            .all(|r| matches!(r, JobReport::Ok | JobReport::Failed));

        if all_terminal {
            for (job, report) in jobs.iter().zip(reports.iter()) {
                info!(job = %job.id(), ?report, "job finished");
            }
            break;
        }
        if args.once {
            info!("--once: single tick cycle complete");
            break;
        }
        debug!(?reports, "cycle complete; waiting for next poll");
    }

    info!("stagehand driver exiting");
    Ok(())
}

/// One tick cycle over every job: advance all stages, then collect the
/// ready-to-submit ones across jobs and bundle them.
///
/// Retryable failures (submission, artifact I/O) are logged and left for the
/// next cycle; state is unchanged by construction. Conflicts and missing
/// channels abort the driver.
pub fn tick_cycle(jobs: &mut [Job], bundler: &mut Bundler) -> Result<()> {
    for job in jobs.iter_mut() {
        if let Err(err) = job.tick() {
            if err.is_retryable() {
                warn!(job = %job.id(), error = %err, "tick failed; retrying next cycle");
            } else {
                return Err(err).with_context(|| format!("ticking job '{}'", job.id()));
            }
        }
    }

    let mut ready: Vec<&mut Box<dyn StageHandle>> =
        jobs.iter_mut().flat_map(|j| j.submittable()).collect();
    if let Err(err) = bundler.submit_all(&mut ready) {
        if err.is_retryable() {
            warn!(error = %err, "bundling pass failed; retrying next cycle");
        } else {
            return Err(err).context("submitting bundles");
        }
    }
    Ok(())
}

/// Construct all jobs from a validated workflow, reconciling every stage
/// against any checkpoint already in its working directory.
pub fn build_jobs(cfg: &WorkflowFile) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for (id, job_cfg) in cfg.job.iter() {
        let workdir = PathBuf::from(&job_cfg.workdir);
        let mut stages: Vec<Box<dyn StageHandle>> = Vec::new();
        for stage_cfg in job_cfg.stages.iter() {
            let stage = backend::script::build_stage(&workdir, stage_cfg, Box::new(PbsQueue))
                .with_context(|| format!("building stage '{}' of job '{}'", stage_cfg.name, id))?;
            stages.push(stage);
        }
        jobs.push(Job::new(id.clone(), stages, cfg.settings.max_retries));
    }
    Ok(jobs)
}

/// Simple dry-run output: print jobs, stages, dependencies and commands.
fn print_dry_run(cfg: &WorkflowFile) {
    println!("stagehand dry-run");
    println!("  bundle.capacity_nodes = {}", cfg.bundle.capacity_nodes);
    println!("  settings.max_retries = {}", cfg.settings.max_retries);
    println!();

    println!("jobs ({}):", cfg.job.len());
    for (id, job) in cfg.job.iter() {
        println!("  - {id} (workdir: {})", job.workdir);
        for stage in job.stages.iter() {
            println!("      stage: {} (nodes: {})", stage.name, stage.nodes);
            println!("        cmd: {}", stage.command);
            if !stage.needs.is_empty() {
                for need in stage.needs.iter() {
                    println!("        needs: {}:{}", need.stage, need.channel);
                }
            }
            if !stage.exports.is_empty() {
                let channels: Vec<&str> =
                    stage.exports.keys().map(|s| s.as_str()).collect();
                println!("        exports: {channels:?}");
            }
        }
    }

    debug!("dry-run complete (no queue interaction)");
}
