//! Record lifecycle envelope and collection catalogue.
//!
//! # Responsibility
//! - Define the canonical record shape shared by every collection.
//! - Provide lifecycle helpers for timestamps and soft-delete semantics.
//!
//! # Invariants
//! - `id` is stable and never reused for another record.
//! - `updated_at >= created_at`, and every mutation strictly increases
//!   `updated_at`.
//! - `deleted_at` is the source of truth for tombstone state.
//! - Entity-specific fields are opaque to this crate and live in `fields`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one record inside its collection.
pub type RecordId = String;

/// Wall-clock instant used for every lifecycle timestamp.
pub type Timestamp = DateTime<Utc>;

/// Entity-specific payload owned by the field editors.
pub type Fields = Map<String, Value>;

/// Field names owned by the lifecycle envelope. Patches must not name them.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "createdAt", "updatedAt", "deletedAt"];

/// Named record collections of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Tasks,
    Projects,
    Modes,
    Tags,
    Wishes,
    Goals,
    Memos,
    MemoTemplates,
    SubTasks,
    DailyRecords,
    RoutineExecutions,
}

impl Collection {
    /// Every collection in snapshot order.
    pub const ALL: [Collection; 11] = [
        Collection::Tasks,
        Collection::Projects,
        Collection::Modes,
        Collection::Tags,
        Collection::Wishes,
        Collection::Goals,
        Collection::Memos,
        Collection::MemoTemplates,
        Collection::SubTasks,
        Collection::DailyRecords,
        Collection::RoutineExecutions,
    ];

    /// Key of this collection inside a serialized `AppData`.
    pub fn json_key(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Projects => "projects",
            Self::Modes => "modes",
            Self::Tags => "tags",
            Self::Wishes => "wishes",
            Self::Goals => "goals",
            Self::Memos => "memos",
            Self::MemoTemplates => "memoTemplates",
            Self::SubTasks => "subTasks",
            Self::DailyRecords => "dailyRecords",
            Self::RoutineExecutions => "routineExecutions",
        }
    }

    /// File name of this collection in split remote layouts.
    pub fn file_name(self) -> String {
        format!("{}.json", self.json_key())
    }

    /// Parses a JSON key (`memoTemplates`) back into a collection.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|collection| collection.json_key() == trimmed)
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.json_key())
    }
}

/// Validation errors for record lifecycle invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    BlankId,
    UpdatedBeforeCreated { id: RecordId },
    DeletedBeforeCreated { id: RecordId },
    ImmutableField(String),
    DuplicateId { collection: Collection, id: RecordId },
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankId => write!(f, "record id cannot be blank"),
            Self::UpdatedBeforeCreated { id } => {
                write!(f, "record {id}: updatedAt is earlier than createdAt")
            }
            Self::DeletedBeforeCreated { id } => {
                write!(f, "record {id}: deletedAt is earlier than createdAt")
            }
            Self::ImmutableField(name) => write!(f, "field `{name}` cannot be changed"),
            Self::DuplicateId { collection, id } => {
                write!(f, "duplicate record id {id} in {collection}")
            }
        }
    }
}

impl Error for RecordValidationError {}

/// One record of any collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Soft delete tombstone kept so deletions reach other devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    /// Creates a record with a generated id and `created_at = updated_at = now`.
    pub fn new(fields: Fields, now: Timestamp) -> Result<Self, RecordValidationError> {
        reject_reserved(&fields)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            fields,
        })
    }

    /// Returns whether this record is visible to active reads.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Latest lifecycle timestamp carried by this record.
    pub fn last_touched(&self) -> Timestamp {
        self.updated_at.max(self.created_at)
    }

    /// Merges `patch` into the field bag and bumps `updated_at`.
    ///
    /// `null` values are stored as-is; removal is a field-editor concern.
    pub fn apply_patch(
        &mut self,
        patch: Fields,
        now: Timestamp,
    ) -> Result<(), RecordValidationError> {
        reject_reserved(&patch)?;
        self.fields.extend(patch);
        self.touch(now);
        Ok(())
    }

    /// Tombstones the record. Returns `false` when it was already deleted.
    pub fn soft_delete(&mut self, now: Timestamp) -> bool {
        if self.deleted_at.is_some() {
            return false;
        }
        self.touch(now);
        self.deleted_at = Some(self.updated_at);
        true
    }

    /// Bumps `updated_at` to `now`, or one millisecond past its previous
    /// value when the clock has not advanced.
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = next_update_stamp(self.updated_at, now);
    }

    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.id.trim().is_empty() {
            return Err(RecordValidationError::BlankId);
        }
        if self.updated_at < self.created_at {
            return Err(RecordValidationError::UpdatedBeforeCreated {
                id: self.id.clone(),
            });
        }
        if matches!(self.deleted_at, Some(deleted_at) if deleted_at < self.created_at) {
            return Err(RecordValidationError::DeletedBeforeCreated {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Strictly increasing successor of `previous` that never lags `now`.
pub fn next_update_stamp(previous: Timestamp, now: Timestamp) -> Timestamp {
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

fn reject_reserved(fields: &Fields) -> Result<(), RecordValidationError> {
    match RESERVED_FIELDS.iter().find(|name| fields.contains_key(**name)) {
        Some(name) => Err(RecordValidationError::ImmutableField((*name).to_string())),
        None => Ok(()),
    }
}
