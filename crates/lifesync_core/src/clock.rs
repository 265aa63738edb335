//! Wall-clock source injected into the store and sync layers.

use crate::model::record::Timestamp;
use chrono::{SubsecRound, Utc};
use std::sync::Arc;

/// Source of "now" for lifecycle timestamps and watermarks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System clock truncated to millisecond precision, so timestamps survive
/// remotes that only keep milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().trunc_subsecs(3)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Returns the default shared system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
