//! Domain model for the synchronized personal dataset.
//!
//! # Responsibility
//! - Define the record lifecycle envelope shared by every collection.
//! - Define the `AppData` aggregate that is persisted, pushed and pulled
//!   as one snapshot.
//!
//! # Invariants
//! - Every record is identified by a stable id that is never reused.
//! - Deletion is represented by `deleted_at` tombstones, not hard delete.
//! - `lastSynced` is the only sync watermark; nothing else in the model
//!   describes remote state.

pub mod app_data;
pub mod record;
