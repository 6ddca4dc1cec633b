//! Execution records for scheduled units.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::unit::UnitOrigin;

/// A record of one unit execution, sent back to the scheduler loop.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub key: String,
    pub origin: UnitOrigin,
    pub status: UnitStatus,
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl UnitReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Failed,
    TimedOut,
    /// Another instance with the same key was still running.
    Skipped,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitStatus::Success => "success",
            UnitStatus::Failed => "failed",
            UnitStatus::TimedOut => "timed_out",
            UnitStatus::Skipped => "skipped",
        })
    }
}
