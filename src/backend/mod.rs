// src/backend/mod.rs

//! Concrete capability-role implementations.
//!
//! The core is agnostic to what calculation a stage runs; [`script`] is the
//! generic backend driven entirely by the workflow file: configured input
//! lines, a batch-queue runner, and a marker-scanning reader. Engine-specific
//! backends implement the same three traits.

pub mod script;

pub use script::{MarkerReader, QueueRunner, ScriptSpec, ScriptWriter, build_stage};
