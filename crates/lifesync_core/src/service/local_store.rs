//! Local Store use-case service.
//!
//! # Responsibility
//! - Own the in-memory `AppData` snapshot and persist it on every mutation.
//! - Provide per-collection get/add/update/delete entry points.
//! - Publish a "data changed" signal for the sync orchestrator.
//!
//! # Invariants
//! - Active reads never return tombstoned records.
//! - The in-memory snapshot is only replaced after the blob write
//!   succeeded; a failed write leaves both copies unchanged.
//! - Only user mutations emit `StoreEvent::Changed`; sync-driven writes do
//!   not, so a pull never schedules another sync.

use crate::clock::SharedClock;
use crate::model::app_data::{AppData, UserSettings};
use crate::model::record::{
    next_update_stamp, Collection, Fields, Record, RecordValidationError, Timestamp,
};
use crate::repo::snapshot_codec::{decode_app_data, encode_app_data};
use crate::repo::state_repo::{RepoError, SharedStateRepository};
use log::{debug, error, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::broadcast;

/// Key of the dataset blob in the state repository.
pub const APP_DATA_KEY: &str = "app_data";

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned to Local Store callers.
#[derive(Debug)]
pub enum StoreError {
    /// The edit did not durably land.
    Repo(RepoError),
    /// Target record does not exist or is tombstoned.
    NotFound { collection: Collection, id: String },
    /// Lifecycle invariant or immutable-field violation.
    Validation(RecordValidationError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::NotFound { collection, id } => write!(f, "{collection} record not found: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::NotFound { .. } => None,
        }
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<RecordValidationError> for StoreError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Signal published after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A user edit landed. `None` means user settings changed.
    Changed { collection: Option<Collection> },
    /// The whole snapshot was overwritten by sync.
    Replaced,
}

/// Persisted, observable owner of the local dataset.
pub struct LocalStore {
    repo: SharedStateRepository,
    data: RwLock<AppData>,
    events: broadcast::Sender<StoreEvent>,
    clock: SharedClock,
}

impl LocalStore {
    /// Loads the persisted snapshot, or starts empty when none exists.
    pub fn open(repo: SharedStateRepository, clock: SharedClock) -> StoreResult<Self> {
        let stored = repo.lock().load_value(APP_DATA_KEY)?;
        let data = match stored {
            Some(raw) => decode_app_data(APP_DATA_KEY, &raw)?,
            None => AppData::default(),
        };
        info!(
            "event=store_open module=store status=ok records={} last_synced={}",
            data.record_count(),
            data.last_synced
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "none".to_string())
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            repo,
            data: RwLock::new(data),
            events,
            clock,
        })
    }

    /// Subscribes to store change signals.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Active records of one collection.
    pub fn get(&self, collection: Collection) -> Vec<Record> {
        self.data
            .read()
            .collection(collection)
            .iter()
            .filter(|record| record.is_active())
            .cloned()
            .collect()
    }

    /// One active record, or `None` when missing or tombstoned.
    pub fn get_by_id(&self, collection: Collection, id: &str) -> Option<Record> {
        self.data
            .read()
            .collection(collection)
            .iter()
            .find(|record| record.id == id && record.is_active())
            .cloned()
    }

    /// Creates a record with a generated id.
    pub fn add(&self, collection: Collection, fields: Fields) -> StoreResult<Record> {
        self.mutate("add", Some(collection), |data, now| {
            let record = Record::new(fields, now)?;
            data.collection_mut(collection).push(record.clone());
            Ok(record)
        })
    }

    /// Merges `patch` into an active record and bumps `updatedAt`.
    pub fn update(&self, collection: Collection, id: &str, patch: Fields) -> StoreResult<Record> {
        self.mutate("update", Some(collection), |data, now| {
            let record = find_active_mut(data, collection, id)?;
            record.apply_patch(patch, now)?;
            Ok(record.clone())
        })
    }

    /// Soft-deletes a record. Deleting a tombstone again is a no-op.
    pub fn delete(&self, collection: Collection, id: &str) -> StoreResult<()> {
        {
            let data = self.data.read();
            let existing = data.collection(collection).iter().find(|r| r.id == id);
            match existing {
                None => {
                    return Err(StoreError::NotFound {
                        collection,
                        id: id.to_string(),
                    })
                }
                Some(record) if !record.is_active() => return Ok(()),
                Some(_) => {}
            }
        }
        self.mutate("delete", Some(collection), |data, now| {
            let record = find_active_mut(data, collection, id)?;
            record.soft_delete(now);
            Ok(())
        })
    }

    pub fn settings(&self) -> UserSettings {
        self.data.read().user_settings.clone()
    }

    /// Merges scalar settings and bumps the settings timestamp.
    pub fn update_settings(&self, patch: Fields) -> StoreResult<UserSettings> {
        self.mutate("update_settings", None, |data, now| {
            let settings = &mut data.user_settings;
            settings.values.extend(patch);
            settings.updated_at = Some(match settings.updated_at {
                Some(previous) => next_update_stamp(previous, now),
                None => now,
            });
            Ok(settings.clone())
        })
    }

    /// Full snapshot, tombstones included.
    pub fn snapshot(&self) -> AppData {
        self.data.read().clone()
    }

    pub fn last_synced(&self) -> Option<Timestamp> {
        self.data.read().last_synced
    }

    /// Wholesale overwrite used by pulls and conflict resolution.
    pub fn replace_snapshot(&self, replacement: AppData) -> StoreResult<()> {
        self.write_sync_state("replace", |data| {
            *data = replacement;
            true
        })
        .map(|_| ())
    }

    /// Overwrites the snapshot only if no local edit landed after
    /// `expected_latest_edit` was observed. Returns whether it replaced.
    pub fn replace_snapshot_if_unmodified(
        &self,
        expected_latest_edit: Option<Timestamp>,
        replacement: AppData,
    ) -> StoreResult<bool> {
        self.write_sync_state("replace", |data| {
            if data.latest_edit() != expected_latest_edit {
                return false;
            }
            *data = replacement;
            true
        })
    }

    /// Moves the sync watermark without touching records.
    pub fn set_last_synced(&self, last_synced: Option<Timestamp>) -> StoreResult<()> {
        self.write_sync_state("set_watermark", |data| {
            data.last_synced = last_synced;
            true
        })
        .map(|_| ())
    }

    /// Moves the watermark to `remote_timestamp` once `pushed` landed.
    ///
    /// Edits that arrived while the push was in flight are not part of
    /// `pushed`; any of them stamped at or before the new watermark are
    /// re-stamped just past it so the next round still pushes them.
    pub fn confirm_push(&self, pushed: &AppData, remote_timestamp: Timestamp) -> StoreResult<()> {
        let past_watermark = next_update_stamp(remote_timestamp, remote_timestamp);
        self.write_sync_state("set_watermark", |data| {
            let mut restamped = 0usize;
            for collection in Collection::ALL {
                let sent: HashMap<&str, &Record> = pushed
                    .collection(collection)
                    .iter()
                    .map(|record| (record.id.as_str(), record))
                    .collect();
                for record in data.collection_mut(collection).iter_mut() {
                    let unchanged = sent.get(record.id.as_str()) == Some(&&*record);
                    if !unchanged && record.last_touched() <= remote_timestamp {
                        record.updated_at = past_watermark;
                        restamped += 1;
                    }
                }
            }

            let settings = &mut data.user_settings;
            if *settings != pushed.user_settings
                && settings.updated_at.is_some_and(|ts| ts <= remote_timestamp)
            {
                settings.updated_at = Some(past_watermark);
                restamped += 1;
            }

            if restamped > 0 {
                debug!("event=store_restamp module=store status=ok records={restamped}");
            }
            data.last_synced = Some(remote_timestamp);
            true
        })
        .map(|_| ())
    }

    /// Applies one user edit. `apply` receives the edit stamp, which is
    /// derived under the write lock and kept strictly past the watermark, so
    /// a `confirm_push` in the same millisecond cannot swallow the edit.
    fn mutate<T>(
        &self,
        op: &'static str,
        collection: Option<Collection>,
        apply: impl FnOnce(&mut AppData, Timestamp) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let now = self.clock.now();
        let mut guard = self.data.write();
        let stamp = match guard.last_synced {
            Some(watermark) if now <= watermark => next_update_stamp(watermark, now),
            _ => now,
        };
        let mut next = guard.clone();
        let value = apply(&mut next, stamp)?;
        self.persist(op, &next)?;
        *guard = next;
        drop(guard);

        info!(
            "event=store_mutation module=store status=ok op={op} collection={}",
            collection.map_or("userSettings", Collection::json_key)
        );
        let _ = self.events.send(StoreEvent::Changed { collection });
        Ok(value)
    }

    fn write_sync_state(
        &self,
        op: &'static str,
        apply: impl FnOnce(&mut AppData) -> bool,
    ) -> StoreResult<bool> {
        let mut guard = self.data.write();
        let mut next = guard.clone();
        if !apply(&mut next) {
            return Ok(false);
        }
        self.persist(op, &next)?;
        let replaced = op == "replace";
        *guard = next;
        drop(guard);

        if replaced {
            let _ = self.events.send(StoreEvent::Replaced);
        }
        Ok(true)
    }

    fn persist(&self, op: &str, data: &AppData) -> StoreResult<()> {
        let result = encode_app_data(data)
            .and_then(|raw| self.repo.lock().save_value(APP_DATA_KEY, &raw));
        if let Err(err) = &result {
            error!("event=store_persist module=store status=error op={op} error={err}");
        }
        result.map_err(StoreError::from)
    }
}

fn find_active_mut<'a>(
    data: &'a mut AppData,
    collection: Collection,
    id: &str,
) -> StoreResult<&'a mut Record> {
    data.collection_mut(collection)
        .iter_mut()
        .find(|record| record.id == id && record.is_active())
        .ok_or_else(|| StoreError::NotFound {
            collection,
            id: id.to_string(),
        })
}
