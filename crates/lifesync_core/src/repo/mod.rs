//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the key/value persistence contract for local state.
//! - Isolate SQLite query details and blob encoding from the store and
//!   sync layers.
//!
//! # Invariants
//! - Snapshot blobs are always written through `snapshot_codec`, so every
//!   stored payload carries its schema version.
//! - Repository APIs surface write failures; nothing is swallowed.

pub mod snapshot_codec;
pub mod state_repo;
