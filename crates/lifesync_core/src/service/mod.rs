//! Core use-case services.
//!
//! # Responsibility
//! - Own the local dataset and backend configuration above the repository
//!   layer.
//! - Keep sync and CLI layers decoupled from storage details.

pub mod local_store;
pub mod settings_store;
