//! Report aggregation over indexed runs.
//!
//! Counts are per run (by run status). An empty range is a valid report with
//! every count at zero.

pub mod render;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub use self::render::{render, ReportMessage};

use crate::index::{IndexError, RunFilter, RunQuery};
use crate::transform::{IndexedDocument, Status};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("querying runs failed: {0}")]
    Query(#[from] IndexError),

    #[error("report range is empty: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("rendering report failed: {0}")]
    Render(#[from] askama::Error),
}

/// One report request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSpec {
    pub branch: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub commit_sha: Option<String>,
    pub recipients: Vec<String>,
}

impl ReportSpec {
    pub fn filter(&self) -> RunFilter {
        RunFilter {
            branch: self.branch.clone(),
            start: self.start,
            end: self.end,
            commit_sha: self.commit_sha.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if self.start > self.end {
            return Err(ReportError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
    pub dead: u64,
    pub error: u64,
    pub unknown: u64,
}

impl Counts {
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
}

/// Most recent run of one suite in the range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteLatest {
    pub suite: String,
    pub job_id: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub link: String,
    pub tasks_total: u64,
    pub tasks_pass: u64,
    pub tasks_failing: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotableFailure {
    pub job_id: String,
    pub suite: String,
    pub status: Status,
    pub failing_tasks: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub link: String,
    /// Template of the first failing task, or its raw reason.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResult {
    pub branch: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub commit_sha: Option<String>,
    pub totals: Counts,
    pub by_suite: BTreeMap<String, Counts>,
    /// Every day of the range, zero-filled.
    pub by_day: BTreeMap<NaiveDate, Counts>,
    pub notable_failures: Vec<NotableFailure>,
    pub latest_by_suite: Vec<SuiteLatest>,
}

impl ReportResult {
    pub fn is_empty(&self) -> bool {
        self.totals.total == 0
    }
}

fn failure_reason(doc: &IndexedDocument) -> Option<String> {
    doc.tasks
        .iter()
        .filter(|t| t.status.is_failure() || t.failure_reason.is_some())
        .find_map(|t| {
            t.failure_template
                .as_ref()
                .map(|tpl| tpl.template.clone())
                .or_else(|| t.failure_reason.clone())
        })
}

fn run_link(results_server: &str, job_id: &str) -> String {
    format!("{}/{}", results_server.trim_end_matches('/'), job_id)
}

/// Aggregate `docs` for `spec`. Documents outside the spec's filter are ignored.
pub fn aggregate(spec: &ReportSpec, docs: &[IndexedDocument], results_server: &str, top_n: usize) -> ReportResult {
    let filter = spec.filter();
    let docs: Vec<&IndexedDocument> = docs.iter().filter(|d| filter.matches(d)).collect();

    let mut by_day: BTreeMap<NaiveDate, Counts> = spec
        .start
        .iter_days()
        .take_while(|d| *d <= spec.end)
        .map(|d| (d, Counts::default()))
        .collect();
    let mut by_suite: BTreeMap<String, Counts> = BTreeMap::new();
    let mut totals = Counts::default();
    let mut latest: BTreeMap<&str, &IndexedDocument> = BTreeMap::new();

    for &doc in &docs {
        totals.add(doc.status);
        by_suite.entry(doc.suite.clone()).or_default().add(doc.status);
        if let Some(day) = doc.run_date.and_then(|d| by_day.get_mut(&d)) {
            day.add(doc.status);
        }

        let newer = match latest.get(doc.suite.as_str()) {
            None => true,
            Some(seen) => (doc.latest_time(), &doc.job_id) > (seen.latest_time(), &seen.job_id),
        };
        if newer {
            latest.insert(doc.suite.as_str(), doc);
        }
    }

    let latest_by_suite = latest
        .into_values()
        .map(|doc| SuiteLatest {
            suite: doc.suite.clone(),
            job_id: doc.job_id.clone(),
            status: doc.status,
            started_at: doc.latest_time(),
            link: run_link(results_server, &doc.job_id),
            tasks_total: doc.task_counts.total,
            tasks_pass: doc.task_counts.pass,
            tasks_failing: doc.task_counts.failing(),
        })
        .collect();

    let mut failures: Vec<&IndexedDocument> = docs
        .iter()
        .copied()
        .filter(|d| d.task_counts.failing() > 0 || d.status.is_failure())
        .collect();
    failures.sort_by(|a, b| {
        b.task_counts
            .failing()
            .cmp(&a.task_counts.failing())
            .then_with(|| b.latest_time().cmp(&a.latest_time()))
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
    let notable_failures = failures
        .into_iter()
        .take(top_n)
        .map(|doc| NotableFailure {
            job_id: doc.job_id.clone(),
            suite: doc.suite.clone(),
            status: doc.status,
            failing_tasks: doc.task_counts.failing(),
            started_at: doc.latest_time(),
            link: run_link(results_server, &doc.job_id),
            reason: failure_reason(doc),
        })
        .collect();

    ReportResult {
        branch: spec.branch.clone(),
        start: spec.start,
        end: spec.end,
        commit_sha: spec.commit_sha.clone(),
        totals,
        by_suite,
        by_day,
        notable_failures,
        latest_by_suite,
    }
}

/// Query the index for `spec` and aggregate the result.
pub async fn build_report(
    query: &dyn RunQuery,
    spec: &ReportSpec,
    results_server: &str,
    top_n: usize,
) -> Result<ReportResult, ReportError> {
    spec.validate()?;
    debug!(branch = %spec.branch, start = %spec.start, end = %spec.end, "building report");

    let docs = query.search_runs(&spec.filter()).await?;
    let report = aggregate(spec, &docs, results_server, top_n);

    info!(
        branch = %report.branch,
        runs = report.totals.total,
        suites = report.by_suite.len(),
        notable = report.notable_failures.len(),
        "report built"
    );
    Ok(report)
}
