//! Core of lifesync: the offline-first sync engine of a personal data
//! manager.
//! This crate owns the local dataset, its persistence and every rule about
//! moving it to and from a remote backend.

pub mod clock;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod sync;

pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use model::app_data::{AppData, UserSettings};
pub use model::record::{Collection, Fields, Record, RecordId, RecordValidationError, Timestamp};
pub use repo::state_repo::{
    share, RepoError, RepoResult, SharedStateRepository, SqliteStateRepository, StateRepository,
    SyncRunRecord,
};
pub use service::local_store::{LocalStore, StoreError, StoreEvent, StoreResult};
pub use service::settings_store::SettingsStore;
pub use sync::backend::{RemoteBackend, WriteOutcome};
pub use sync::backend_registry::{BackendRegistry, BackendRegistryError};
pub use sync::config::{BackendKind, BackendSettings, CloudflareConfig, GitHubConfig, SyncOptions};
pub use sync::conflict::{ConflictChoice, ConflictInfo, Resolution};
pub use sync::error::{SyncError, SyncResult};
pub use sync::orchestrator::{LifecycleEvent, SyncOrchestrator, SyncStatus};
pub use sync::outcome::{SyncEvent, SyncOutcome, SyncReport};

/// Minimal health-check API for wiring checks.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
