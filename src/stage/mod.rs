// src/stage/mod.rs

//! The per-stage lifecycle.
//!
//! - [`roles`] defines the three capability traits a stage composes
//!   (input writer, job runner, output reader).
//! - [`record`] holds the persistent field set and the status enums.
//! - [`lifecycle`] contains the state machine itself: `advance()`,
//!   checkpointing, recovery from killed runs, and channel exports.

pub mod lifecycle;
pub mod record;
pub mod roles;

pub use lifecycle::{Export, Stage, StageDef, StageHandle};
pub use record::{StageRecord, StageReport, StageSpec, StageState};
pub use roles::{ArtifactSet, CollectOutcome, InputWriter, JobRunner, Need, OutputReader, ResolvedInputs};
