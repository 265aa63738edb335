//! Bidirectional sync decision procedure.
//!
//! # Responsibility
//! - Decide between pull, push, no-op and conflict for one sync round.
//! - Apply the decision to the local store and the remote backend.
//!
//! # Invariants
//! - Local edits newer than the watermark are always pushed before an
//!   automatic pull is considered.
//! - Exact watermark/remote-timestamp equality is the only up-to-date case.
//! - A version conflict overwrites neither side.
//! - A pull never overwrites an edit that landed while it was in flight.

use crate::clock::Clock;
use crate::model::app_data::AppData;
use crate::model::record::Timestamp;
use crate::service::local_store::LocalStore;
use crate::sync::backend::{RemoteBackend, WriteOutcome};
use crate::sync::conflict::ConflictInfo;
use crate::sync::error::{SyncError, SyncResult};
use log::{debug, info};

/// What one sync round did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Pulled,
    Pushed,
    UpToDate,
    Conflict(Box<ConflictInfo>),
    /// Nothing applied; a local edit raced the pull and wins next round.
    Deferred(String),
}

/// Whether local data holds edits the remote has not seen.
///
/// A dataset without any timestamps has nothing to push.
pub fn has_local_changes(watermark: Option<Timestamp>, latest_edit: Option<Timestamp>) -> bool {
    match (watermark, latest_edit) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(watermark), Some(latest_edit)) => latest_edit > watermark,
    }
}

/// Runs one full sync round against `backend`.
pub async fn run_sync(
    store: &LocalStore,
    backend: &dyn RemoteBackend,
    clock: &dyn Clock,
) -> SyncResult<SyncAction> {
    backend.prepare().await?;

    let local = store.snapshot();
    let watermark = local.last_synced;
    let latest_edit = local.latest_edit();
    let local_changes = has_local_changes(watermark, latest_edit);
    let remote_timestamp = backend.read_remote_timestamp(watermark).await?;

    debug!(
        "event=sync_decide module=sync local_changes={} watermark={} remote={}",
        local_changes,
        format_ts(watermark),
        format_ts(remote_timestamp)
    );

    if local_changes {
        return push(store, backend, clock, local).await;
    }

    let Some(remote_timestamp) = remote_timestamp else {
        return push(store, backend, clock, local).await;
    };

    if watermark == Some(remote_timestamp) {
        return Ok(SyncAction::UpToDate);
    }

    if watermark.map_or(true, |watermark| remote_timestamp > watermark) {
        return pull(store, backend, clock, local).await;
    }

    push(store, backend, clock, local).await
}

async fn push(
    store: &LocalStore,
    backend: &dyn RemoteBackend,
    clock: &dyn Clock,
    local: AppData,
) -> SyncResult<SyncAction> {
    let now = clock.now();
    // The watermark must cover every edit it ships.
    let stamp = local.latest_edit().map_or(now, |edit| edit.max(now));
    let expected = local.last_synced;
    let outgoing = local.with_watermark(Some(stamp));

    match backend.write_remote_snapshot(&outgoing, expected).await? {
        WriteOutcome::Written { remote_timestamp } => {
            store.confirm_push(&outgoing, remote_timestamp)?;
            info!(
                "event=sync_push module=sync status=ok records={} remote={}",
                outgoing.record_count(),
                remote_timestamp.to_rfc3339()
            );
            Ok(SyncAction::Pushed)
        }
        WriteOutcome::Conflict => {
            let conflict = build_conflict(backend, local).await?;
            info!(
                "event=sync_push module=sync status=conflict remote={}",
                format_ts(conflict.remote_last_modified)
            );
            Ok(SyncAction::Conflict(Box::new(conflict)))
        }
    }
}

async fn pull(
    store: &LocalStore,
    backend: &dyn RemoteBackend,
    clock: &dyn Clock,
    local: AppData,
) -> SyncResult<SyncAction> {
    let Some(remote) = backend.read_remote_snapshot(local.last_synced).await? else {
        // Remote vanished between the timestamp read and now.
        return push(store, backend, clock, local).await;
    };
    remote
        .validate()
        .map_err(|err| SyncError::Validation(err.to_string()))?;

    let replaced = store.replace_snapshot_if_unmodified(local.latest_edit(), remote.clone())?;
    if !replaced {
        return Ok(SyncAction::Deferred(
            "local edits arrived during pull; they will be pushed next".to_string(),
        ));
    }
    info!(
        "event=sync_pull module=sync status=ok records={} remote={}",
        remote.record_count(),
        format_ts(remote.last_synced)
    );
    Ok(SyncAction::Pulled)
}

async fn build_conflict(backend: &dyn RemoteBackend, local: AppData) -> SyncResult<ConflictInfo> {
    let remote_snapshot = backend.read_remote_snapshot(local.last_synced).await?;
    let remote_last_modified = match &remote_snapshot {
        Some(remote) => remote.last_synced,
        None => backend.read_remote_timestamp(local.last_synced).await?,
    };
    let remote_snapshot =
        remote_snapshot.unwrap_or_else(|| AppData::default().with_watermark(remote_last_modified));
    remote_snapshot
        .validate()
        .map_err(|err| SyncError::Validation(err.to_string()))?;

    Ok(ConflictInfo {
        local_last_modified: local.latest_edit(),
        local_snapshot: local,
        remote_snapshot,
        remote_last_modified,
    })
}

fn format_ts(value: Option<Timestamp>) -> String {
    value.map_or_else(|| "none".to_string(), |ts| ts.to_rfc3339())
}
