//! Normalization of raw registry runs into index documents.
//!
//! Everything here is pure: no I/O, no clock, no shared state. Identical
//! input always produces an identical document, which is what makes index
//! writes safe to repeat.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{CommitKey, UNKNOWN_SUITE};
use crate::source::{RawRun, RawTask};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("run has no job id (branch {branch}, suite {suite})")]
    MissingJobId { branch: String, suite: String },
}

/// Outcome of a run or a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Dead,
    Error,
    #[default]
    Unknown,
}

impl Status {
    /// Map a registry status string. Anything unrecognised is `Unknown`.
    pub fn parse(raw: Option<&str>) -> Status {
        let Some(raw) = raw else {
            return Status::Unknown;
        };
        let lowered = raw.trim().to_ascii_lowercase();
        let word = lowered.strip_prefix("finished").map(str::trim).unwrap_or(&lowered);
        match word {
            "pass" | "passed" | "success" => Status::Pass,
            "fail" | "failed" | "failure" => Status::Fail,
            "dead" => Status::Dead,
            "error" => Status::Error,
            _ => Status::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Dead => "dead",
            Status::Error => "error",
            Status::Unknown => "unknown",
        }
    }

    /// The registry still has work to do for a run or task in this state.
    pub fn is_in_flight(raw: Option<&str>) -> bool {
        let Some(raw) = raw else {
            return false;
        };
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "running" | "queued" | "waiting" | "scheduled" | "started"
        )
    }

    /// Counts toward a notable failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Fail | Status::Dead | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub status: Status,
    pub duration_secs: Option<f64>,
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Filled in by the template miner after normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_template: Option<FailureTemplate>,
}

/// Cluster a failure reason was mined into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTemplate {
    pub id: u64,
    pub template: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
    pub dead: u64,
    pub error: u64,
    pub unknown: u64,
}

impl TaskCounts {
    pub fn add(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Pass => self.pass += 1,
            Status::Fail => self.fail += 1,
            Status::Dead => self.dead += 1,
            Status::Error => self.error += 1,
            Status::Unknown => self.unknown += 1,
        }
    }

    pub fn failing(&self) -> u64 {
        self.fail + self.dead + self.error
    }
}

/// Canonical run document as stored in the search index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedDocument {
    pub id: Uuid,
    pub job_id: String,
    pub namespace: String,
    pub branch: Option<String>,
    pub suite: String,
    pub user: Option<String>,
    pub machine_type: Option<String>,
    pub commit_sha: Option<String>,
    pub status: Status,
    pub run_date: Option<NaiveDate>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub task_counts: TaskCounts,
    pub tasks: Vec<TaskResult>,
    /// The run or one of its tasks had not finished when fetched.
    pub in_flight: bool,
}

impl IndexedDocument {
    /// Ledger key for this run, if it carries a commit.
    pub fn commit_key(&self) -> Option<CommitKey> {
        self.commit_sha
            .as_ref()
            .map(|sha| CommitKey::new(sha.clone(), self.suite.clone()))
    }

    /// Most relevant timestamp for ordering runs.
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.scheduled_at).or(self.posted_at)
    }
}

/// Stable id of a run: UUID v5 of `<namespace>/<job id>`.
pub fn document_id(namespace: &str, job_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{namespace}/{job_id}").as_bytes())
}

/// Normalize one registry run.
pub fn normalize(run: &RawRun, namespace: &str) -> Result<IndexedDocument, TransformError> {
    let suite = run.suite.clone().unwrap_or_else(|| UNKNOWN_SUITE.to_string());
    let Some(job_id) = run.job_id.clone() else {
        return Err(TransformError::MissingJobId {
            branch: run.branch.clone().unwrap_or_else(|| "?".to_string()),
            suite,
        });
    };

    let mut tasks: Vec<TaskResult> = run.jobs.iter().flatten().map(task_result).collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.task_id.cmp(&b.task_id)));

    let mut task_counts = TaskCounts::default();
    for task in &tasks {
        task_counts.add(task.status);
    }

    let status = match Status::parse(run.status.as_deref()) {
        Status::Unknown => derive_status(&task_counts),
        known => known,
    };

    let scheduled_at = run.scheduled.as_deref().and_then(parse_timestamp);
    let started_at = run.started.as_deref().and_then(parse_timestamp);
    let posted_at = run.posted.as_deref().and_then(parse_timestamp);
    let run_date = scheduled_at.or(started_at).or(posted_at).map(|ts| ts.date_naive());
    let in_flight = Status::is_in_flight(run.status.as_deref())
        || run.jobs.iter().flatten().any(|t| Status::is_in_flight(t.status.as_deref()));

    Ok(IndexedDocument {
        id: document_id(namespace, &job_id),
        job_id,
        namespace: namespace.to_string(),
        branch: run.branch.clone(),
        suite,
        user: run.user.clone(),
        machine_type: run.machine_type.clone(),
        commit_sha: run.sha1.clone(),
        status,
        run_date,
        scheduled_at,
        started_at,
        updated_at: run.updated.as_deref().and_then(parse_timestamp),
        posted_at,
        task_counts,
        tasks,
        in_flight,
    })
}

fn task_result(task: &RawTask) -> TaskResult {
    let name = task
        .description
        .clone()
        .or_else(|| task.name.clone())
        .or_else(|| task.job_id.clone())
        .unwrap_or_else(|| "unnamed".to_string());
    TaskResult {
        name,
        status: Status::parse(task.status.as_deref()),
        duration_secs: task.duration.filter(|d| d.is_finite()),
        task_id: task.job_id.clone(),
        failure_reason: task.failure_reason.clone().filter(|r| !r.trim().is_empty()),
        failure_template: None,
    }
}

/// Run status when the registry does not give a usable one.
fn derive_status(counts: &TaskCounts) -> Status {
    if counts.error > 0 {
        Status::Error
    } else if counts.dead > 0 {
        Status::Dead
    } else if counts.fail > 0 {
        Status::Fail
    } else if counts.total > 0 && counts.pass == counts.total {
        Status::Pass
    } else {
        Status::Unknown
    }
}

/// Parse RFC 3339 or `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
