//! Cron triggers and schedule entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct InvalidCron {
    pub expr: String,
    pub reason: String,
}

/// Parsed cron expression, evaluated in UTC.
///
/// Accepts the `cron` crate's six/seven field form (with seconds) and the
/// classic five-field form, which fires at second 0.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expr: String,
    schedule: CronSchedule,
}

impl CronTrigger {
    pub fn parse(expr: &str) -> Result<Self, InvalidCron> {
        let trimmed = expr.trim();
        let full = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule = CronSchedule::from_str(&full).map_err(|e| InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }

    /// Fire times in `(from, until]`.
    pub fn between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take_while(|t| *t <= until).collect()
    }
}

// ---------------------------------------------------------------------------
// Schedule entries
// ---------------------------------------------------------------------------

/// One configured job: a cron expression plus what to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub task: ScheduledTask,
}

fn default_true() -> bool {
    true
}

fn default_days() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledTask {
    /// Ingest today's runs, one unit per (suite, branch). No branches means any branch.
    Ingest {
        suites: Vec<String>,
        #[serde(default)]
        branches: Vec<String>,
        /// Registry user; defaults to the scheduler user.
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        machine_type: Option<String>,
    },
    /// Mail a summary covering the last `days` days, ending today.
    Report {
        branch: String,
        recipients: Vec<String>,
        #[serde(default = "default_days")]
        days: u32,
        #[serde(default)]
        commit_sha: Option<String>,
    },
}

impl ScheduledTask {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduledTask::Ingest { .. } => "ingest",
            ScheduledTask::Report { .. } => "report",
        }
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.name, self.task.kind(), self.cron)
    }
}

/// One upcoming fire time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewItem {
    pub at: DateTime<Utc>,
    pub name: String,
    pub kind: &'static str,
}

/// Every fire of the enabled `entries` within `hours` after `now`, in time order.
pub fn preview(entries: &[ScheduleEntry], now: DateTime<Utc>, hours: u64) -> Result<Vec<PreviewItem>, InvalidCron> {
    let until = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
    let mut items = Vec::new();
    for entry in entries.iter().filter(|e| e.enabled) {
        let trigger = CronTrigger::parse(&entry.cron)?;
        items.extend(trigger.between(now, until).into_iter().map(|at| PreviewItem {
            at,
            name: entry.name.clone(),
            kind: entry.task.kind(),
        }));
    }
    items.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.name.cmp(&b.name)));
    Ok(items)
}
