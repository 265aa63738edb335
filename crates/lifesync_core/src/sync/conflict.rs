//! Conflict holding and human-driven resolution.
//!
//! # Responsibility
//! - Keep at most one open conflict between a local and remote snapshot.
//! - Apply the user's choice: keep local, keep remote, or cancel.
//!
//! # Invariants
//! - Nothing resolves a conflict automatically.
//! - A failed resolution leaves the conflict open for another attempt.

use crate::clock::Clock;
use crate::model::app_data::AppData;
use crate::model::record::Timestamp;
use crate::service::local_store::LocalStore;
use crate::sync::backend::RemoteBackend;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::outcome::SyncEvent;
use log::info;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Both sides of a version conflict as observed when it was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub local_snapshot: AppData,
    pub remote_snapshot: AppData,
    pub local_last_modified: Option<Timestamp>,
    pub remote_last_modified: Option<Timestamp>,
}

/// User decision for an open conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Local,
    Remote,
    Cancel,
}

impl ConflictChoice {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// What a successful resolution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pushed,
    Pulled,
    Cancelled,
}

pub struct ConflictResolver {
    open: Mutex<Option<ConflictInfo>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ConflictResolver {
    pub fn new(events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            open: Mutex::new(None),
            events,
        }
    }

    /// Stores `conflict`, replacing any older one.
    pub fn open(&self, conflict: ConflictInfo) {
        let replaced = self.open.lock().replace(conflict).is_some();
        info!("event=conflict_open module=conflict replaced={replaced}");
        let _ = self.events.send(SyncEvent::ConflictDetected);
    }

    pub fn pending(&self) -> Option<ConflictInfo> {
        self.open.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    /// Applies `choice` to the open conflict.
    ///
    /// `Local` pushes the store's current snapshot, so edits made while the
    /// conflict was open are kept. `backend` is only needed for `Local`.
    ///
    /// # Errors
    /// - `NoOpenConflict` when nothing awaits resolution.
    /// - `Configuration` when `Local` is chosen without a backend.
    /// - Any backend or store error; the conflict then stays open.
    pub async fn resolve(
        &self,
        choice: ConflictChoice,
        store: &LocalStore,
        backend: Option<&dyn RemoteBackend>,
        clock: &dyn Clock,
    ) -> SyncResult<Resolution> {
        let conflict = self.pending().ok_or(SyncError::NoOpenConflict)?;

        let resolution = match choice {
            ConflictChoice::Cancel => Resolution::Cancelled,
            ConflictChoice::Local => {
                let backend = backend.ok_or_else(|| {
                    SyncError::Configuration("no active backend to push to".to_string())
                })?;
                let local = store.snapshot();
                let now = clock.now();
                let stamp = local.latest_edit().map_or(now, |edit| edit.max(now));
                let outgoing = local.with_watermark(Some(stamp));
                let remote_timestamp = backend.force_write_remote_snapshot(&outgoing).await?;
                store.confirm_push(&outgoing, remote_timestamp)?;
                Resolution::Pushed
            }
            ConflictChoice::Remote => {
                let replacement = conflict
                    .remote_snapshot
                    .with_watermark(conflict.remote_last_modified);
                store.replace_snapshot(replacement)?;
                Resolution::Pulled
            }
        };

        self.open.lock().take();
        info!(
            "event=conflict_resolve module=conflict status=ok choice={}",
            resolution_label(resolution)
        );
        let event = match resolution {
            Resolution::Cancelled => SyncEvent::ConflictCancelled,
            other => SyncEvent::ConflictResolved(other),
        };
        let _ = self.events.send(event);
        Ok(resolution)
    }
}

fn resolution_label(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Pushed => "local",
        Resolution::Pulled => "remote",
        Resolution::Cancelled => "cancel",
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictChoice, ConflictInfo, ConflictResolver, Resolution};
    use crate::clock::system_clock;
    use crate::db::open_db_in_memory;
    use crate::model::app_data::AppData;
    use crate::model::record::{Collection, Fields};
    use crate::repo::state_repo::{share, SqliteStateRepository};
    use crate::service::local_store::LocalStore;
    use crate::sync::error::SyncError;
    use crate::sync::outcome::SyncEvent;
    use chrono::{TimeZone, Utc};
    use tokio::sync::broadcast;

    fn store() -> LocalStore {
        let repo = SqliteStateRepository::try_new(open_db_in_memory().unwrap()).unwrap();
        LocalStore::open(share(repo), system_clock()).unwrap()
    }

    fn conflict(local: AppData) -> ConflictInfo {
        let remote_ts = Utc.with_ymd_and_hms(2024, 9, 9, 9, 0, 0).unwrap();
        ConflictInfo {
            local_last_modified: local.latest_edit(),
            local_snapshot: local,
            remote_snapshot: AppData::default().with_watermark(Some(remote_ts)),
            remote_last_modified: Some(remote_ts),
        }
    }

    #[tokio::test]
    async fn resolve_without_conflict_is_rejected() {
        let (events, _) = broadcast::channel(8);
        let resolver = ConflictResolver::new(events);
        let err = resolver
            .resolve(ConflictChoice::Cancel, &store(), None, &*system_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoOpenConflict));
    }

    #[tokio::test]
    async fn cancel_clears_without_touching_data() {
        let store = store();
        store.add(Collection::Tasks, Fields::new()).unwrap();
        let before = store.snapshot();

        let (events, mut rx) = broadcast::channel(8);
        let resolver = ConflictResolver::new(events);
        resolver.open(conflict(before.clone()));
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::ConflictDetected);

        let resolution = resolver
            .resolve(ConflictChoice::Cancel, &store, None, &*system_clock())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Cancelled);
        assert!(!resolver.is_open());
        assert_eq!(store.snapshot(), before);
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::ConflictCancelled);
    }

    #[tokio::test]
    async fn keep_local_without_backend_leaves_conflict_open() {
        let store = store();
        let (events, _) = broadcast::channel(8);
        let resolver = ConflictResolver::new(events);
        resolver.open(conflict(store.snapshot()));

        let err = resolver
            .resolve(ConflictChoice::Local, &store, None, &*system_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(resolver.is_open());
    }

    #[tokio::test]
    async fn keep_remote_overwrites_local_with_remote_watermark() {
        let store = store();
        store.add(Collection::Goals, Fields::new()).unwrap();
        let (events, _) = broadcast::channel(8);
        let resolver = ConflictResolver::new(events);
        let info = conflict(store.snapshot());
        resolver.open(info.clone());

        let resolution = resolver
            .resolve(ConflictChoice::Remote, &store, None, &*system_clock())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Pulled);
        assert!(store.get(Collection::Goals).is_empty());
        assert_eq!(store.last_synced(), info.remote_last_modified);
    }

    #[test]
    fn newer_conflict_replaces_older() {
        let (events, _) = broadcast::channel(8);
        let resolver = ConflictResolver::new(events);
        let first = conflict(AppData::default());
        let mut second = first.clone();
        second.remote_last_modified = None;
        resolver.open(first);
        resolver.open(second.clone());
        assert_eq!(resolver.pending(), Some(second));
    }

    #[test]
    fn parses_choice_labels() {
        assert_eq!(ConflictChoice::parse("local"), Some(ConflictChoice::Local));
        assert_eq!(ConflictChoice::parse("remote"), Some(ConflictChoice::Remote));
        assert_eq!(ConflictChoice::parse("cancel"), Some(ConflictChoice::Cancel));
        assert_eq!(ConflictChoice::parse("both"), None);
    }
}
