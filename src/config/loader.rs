// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::model::WorkflowFile;
use crate::config::validate::validate_workflow;

/// Load a workflow file from a given path and return the raw `WorkflowFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (dependency graph correctness, etc.). Use [`load_and_validate`]
/// for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading workflow file at {:?}", path))?;

    let workflow: WorkflowFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML workflow from {:?}", path))?;

    Ok(workflow)
}

/// Load a workflow file from path and run semantic validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for:
///   - duplicate stage names within a job,
///   - unknown or self-referential `needs` entries,
///   - cycles in the per-job dependency graph,
///   - basic resource sanity (nonzero nodes and bundle capacity).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let workflow = load_from_path(&path)?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}
