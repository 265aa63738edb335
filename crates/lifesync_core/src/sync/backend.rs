//! Backend-agnostic remote contract consumed by the sync algorithm.

use crate::model::app_data::AppData;
use crate::model::record::Timestamp;
use crate::sync::config::BackendKind;
use crate::sync::error::SyncResult;
use async_trait::async_trait;

/// Result of an optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote accepted the snapshot and now reports `remote_timestamp`.
    Written { remote_timestamp: Timestamp },
    /// The expected version token no longer matches the remote.
    Conflict,
}

/// One remote storage backend.
///
/// Snapshots handed to writes already carry the new `last_synced` stamp;
/// adapters store it as the remote last-modified time.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// One-time remote preparation (layout migrations) before any sync.
    async fn prepare(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Remote last-modified time; `None` when no remote data exists.
    ///
    /// `local_watermark` is the caller's `last_synced`; endpoints that take
    /// it as a query hint receive it, others ignore it.
    async fn read_remote_timestamp(
        &self,
        local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<Timestamp>>;

    /// Full remote snapshot with `last_synced` set to the remote timestamp.
    async fn read_remote_snapshot(
        &self,
        local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<AppData>>;

    /// Writes `snapshot` if the remote still matches `expected`.
    async fn write_remote_snapshot(
        &self,
        snapshot: &AppData,
        expected: Option<Timestamp>,
    ) -> SyncResult<WriteOutcome>;

    /// Writes `snapshot` unconditionally and returns the remote timestamp.
    async fn force_write_remote_snapshot(&self, snapshot: &AppData) -> SyncResult<Timestamp>;
}
