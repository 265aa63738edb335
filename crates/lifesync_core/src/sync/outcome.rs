//! Sync outcomes, reports and broadcast events.

use crate::sync::conflict::Resolution;
use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Terminal result of one `sync_now()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    Pulled,
    Pushed,
    UpToDate,
    Conflict,
    Skipped,
    Error,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pulled => "pulled",
            Self::Pushed => "pushed",
            Self::UpToDate => "up-to-date",
            Self::Conflict => "conflict",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Whether data moved in either direction.
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::Pulled | Self::Pushed)
    }
}

impl Display for SyncOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub message: String,
}

impl SyncReport {
    pub fn new(outcome: SyncOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }
}

/// Notifications published by the orchestrator and conflict resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started,
    Finished(SyncReport),
    ConflictDetected,
    ConflictCancelled,
    ConflictResolved(Resolution),
}
