// src/checkpoint/mod.rs

//! Durable stage snapshots.
//!
//! - [`store`] persists a [`crate::stage::StageRecord`] atomically
//!   (write-then-rename) and loads it back.
//! - [`reconcile`] is the consistency checker: a structural diff over the
//!   flattened field table plus an allow-list-based safe merge, used both at
//!   stage construction and for explicit configuration updates.

pub mod reconcile;
pub mod store;

pub use reconcile::{FieldDiff, diff, reconcile};
pub use store::{load, record_from_table, record_to_table, save};
