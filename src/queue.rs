// src/queue.rs

//! Batch queue clients.
//!
//! The core treats the cluster's queueing system as an opaque, eventually
//! polled resource behind the [`BatchQueue`] trait: submit a rendered script,
//! get back an external job id, and ask later whether any of a stage's ids is
//! still alive. [`PbsQueue`] drives the PBS `qsub`/`qstat` command-line tools
//! as external processes; tests substitute scripted fakes.

use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use crate::errors::{OrchestratorError, Result};

/// What the queue knows about a set of job ids.
///
/// `Unknown` covers both "never submitted" and "the queue lost track of it";
/// the stage lifecycle disambiguates via the output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Unknown,
}

/// Interface the core depends on for talking to the batch system.
pub trait BatchQueue {
    /// Submit a rendered script; returns the external job id.
    fn submit(&mut self, script_path: &Path, jobname: &str) -> Result<String>;

    /// Report `Running` if any of the given ids is queued or running.
    fn poll(&mut self, queue_ids: &[String]) -> QueueState;
}

/// PBS client invoking `qsub` and `qstat`.
#[derive(Debug, Default)]
pub struct PbsQueue;

impl BatchQueue for PbsQueue {
    fn submit(&mut self, script_path: &Path, jobname: &str) -> Result<String> {
        let output = Command::new("qsub")
            .arg(script_path)
            .output()
            .map_err(|e| OrchestratorError::Submission(format!("spawning qsub: {e}")))?;

        if !output.status.success() {
            return Err(OrchestratorError::Submission(format!(
                "qsub exited with {} for '{}': {}",
                output.status,
                jobname,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_qsub_id(&stdout) {
            Some(id) => {
                debug!(jobname, queue_id = %id, "qsub accepted bundle");
                Ok(id)
            }
            None => Err(OrchestratorError::Submission(format!(
                "could not parse a queue id from qsub output: {:?}",
                stdout.trim()
            ))),
        }
    }

    fn poll(&mut self, queue_ids: &[String]) -> QueueState {
        if queue_ids.is_empty() {
            return QueueState::Unknown;
        }

        let output = match Command::new("qstat").output() {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "qstat invocation failed; reporting unknown");
                return QueueState::Unknown;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if qstat_reports_running(&stdout, queue_ids) {
            QueueState::Running
        } else {
            QueueState::Unknown
        }
    }
}

/// Extract the numeric queue id from qsub output such as
/// `4819103.cluster-head.example.edu`.
pub fn parse_qsub_id(stdout: &str) -> Option<String> {
    let token = stdout.split_whitespace().next()?;
    let id = token.split('.').next()?;
    if id.is_empty() { None } else { Some(id.to_string()) }
}

/// Scan tabular `qstat` output for any of the given ids in state R or Q.
///
/// The state column is the fifth field of a job line:
///
/// ```text
/// 4819103.head  scf_bundle_0  someuser  00:01:13  R  normal
/// ```
pub fn qstat_reports_running(qstat: &str, queue_ids: &[String]) -> bool {
    for line in qstat.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let line_id = fields[0].split('.').next().unwrap_or("");
        if queue_ids.iter().any(|qid| qid == line_id) {
            let state = fields[4];
            if state == "R" || state == "Q" {
                return true;
            }
        }
    }
    false
}
