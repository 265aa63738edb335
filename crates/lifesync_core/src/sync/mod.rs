//! Sync engine: remote backends, the decision algorithm, conflicts and
//! the orchestrator that schedules rounds.
//!
//! # Responsibility
//! - Reconcile the local dataset with exactly one active remote backend.
//! - Keep transport details behind the `RemoteBackend` seam.
//!
//! # Invariants
//! - At most one sync round runs per orchestrator.
//! - Version conflicts are surfaced, never silently resolved.

pub mod algorithm;
pub mod backend;
pub mod backend_registry;
pub mod cloudflare;
pub mod config;
pub mod conflict;
pub mod error;
pub mod github;
pub mod orchestrator;
pub mod outcome;
