//! `AppData` aggregate root.
//!
//! # Responsibility
//! - Hold every collection, the user settings and the sync watermark.
//! - Answer the questions the sync algorithm asks of a snapshot: latest
//!   local edit, structural validity, content equality.
//!
//! # Invariants
//! - Record ids are unique within each collection.
//! - `last_synced` is excluded from content comparisons.

use crate::model::record::{Collection, Fields, Record, RecordValidationError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Scalar user settings plus their own edit timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    #[serde(flatten)]
    pub values: Fields,
}

/// Full local dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub tasks: Vec<Record>,
    #[serde(default)]
    pub projects: Vec<Record>,
    #[serde(default)]
    pub modes: Vec<Record>,
    #[serde(default)]
    pub tags: Vec<Record>,
    #[serde(default)]
    pub wishes: Vec<Record>,
    #[serde(default)]
    pub goals: Vec<Record>,
    #[serde(default)]
    pub memos: Vec<Record>,
    #[serde(default)]
    pub memo_templates: Vec<Record>,
    #[serde(default)]
    pub sub_tasks: Vec<Record>,
    #[serde(default)]
    pub daily_records: Vec<Record>,
    #[serde(default)]
    pub routine_executions: Vec<Record>,
    #[serde(default)]
    pub user_settings: UserSettings,
    /// Last point at which local data was known to match the remote.
    #[serde(default)]
    pub last_synced: Option<Timestamp>,
}

impl AppData {
    pub fn collection(&self, collection: Collection) -> &Vec<Record> {
        match collection {
            Collection::Tasks => &self.tasks,
            Collection::Projects => &self.projects,
            Collection::Modes => &self.modes,
            Collection::Tags => &self.tags,
            Collection::Wishes => &self.wishes,
            Collection::Goals => &self.goals,
            Collection::Memos => &self.memos,
            Collection::MemoTemplates => &self.memo_templates,
            Collection::SubTasks => &self.sub_tasks,
            Collection::DailyRecords => &self.daily_records,
            Collection::RoutineExecutions => &self.routine_executions,
        }
    }

    pub fn collection_mut(&mut self, collection: Collection) -> &mut Vec<Record> {
        match collection {
            Collection::Tasks => &mut self.tasks,
            Collection::Projects => &mut self.projects,
            Collection::Modes => &mut self.modes,
            Collection::Tags => &mut self.tags,
            Collection::Wishes => &mut self.wishes,
            Collection::Goals => &mut self.goals,
            Collection::Memos => &mut self.memos,
            Collection::MemoTemplates => &mut self.memo_templates,
            Collection::SubTasks => &mut self.sub_tasks,
            Collection::DailyRecords => &mut self.daily_records,
            Collection::RoutineExecutions => &mut self.routine_executions,
        }
    }

    /// Iterates every stored record, tombstones included.
    pub fn records(&self) -> impl Iterator<Item = (Collection, &Record)> + '_ {
        Collection::ALL.into_iter().flat_map(move |collection| {
            self.collection(collection)
                .iter()
                .map(move |record| (collection, record))
        })
    }

    /// Most recent edit anywhere in the dataset.
    ///
    /// Returns `None` when the dataset carries no timestamps at all.
    pub fn latest_edit(&self) -> Option<Timestamp> {
        self.records()
            .map(|(_, record)| record.last_touched())
            .chain(self.user_settings.updated_at)
            .max()
    }

    /// Total stored records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records().count()
    }

    /// Compares two snapshots ignoring their watermarks.
    pub fn content_eq(&self, other: &AppData) -> bool {
        self.without_watermark() == other.without_watermark()
    }

    /// Copy of this snapshot carrying `last_synced`.
    pub fn with_watermark(&self, last_synced: Option<Timestamp>) -> AppData {
        AppData {
            last_synced,
            ..self.clone()
        }
    }

    /// Checks record invariants and per-collection id uniqueness.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        for collection in Collection::ALL {
            let mut seen = HashSet::new();
            for record in self.collection(collection) {
                record.validate()?;
                if !seen.insert(record.id.as_str()) {
                    return Err(RecordValidationError::DuplicateId {
                        collection,
                        id: record.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn without_watermark(&self) -> AppData {
        self.with_watermark(None)
    }
}
