//! Sync error taxonomy.
//!
//! Configuration errors make a round report `skipped`; every other variant
//! reaching the orchestrator reports `error`. Conflicts found by an
//! optimistic write are not errors; they travel as `WriteOutcome::Conflict`.

use crate::repo::state_repo::RepoError;
use crate::service::local_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or rejected backend credentials. Not retried automatically.
    #[error("backend configuration error: {0}")]
    Configuration(String),
    /// Transport failure or unexpected remote status. Retried on next trigger.
    #[error("network error: {0}")]
    Network(String),
    /// A forced write lost a race with another writer.
    #[error("remote version conflict: {0}")]
    VersionConflict(String),
    /// Remote object absent; callers read this as "no remote data yet".
    #[error("remote data not found: {0}")]
    NotFound(String),
    /// Malformed remote payload. Local data is left untouched.
    #[error("invalid remote payload: {0}")]
    Validation(String),
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    #[error("no conflict is awaiting resolution")]
    NoOpenConflict,
    #[error("a sync is already in progress")]
    SyncInFlight,
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Validation(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

impl From<RepoError> for SyncError {
    fn from(value: RepoError) -> Self {
        Self::Store(StoreError::from(value))
    }
}
