//! HTML rendering of a report into a mail message.

use askama::Template;
use serde::Serialize;

use super::{Counts, ReportError, ReportResult};

/// A rendered report, ready for the mailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportMessage {
    pub subject: String,
    pub html_body: String,
    pub recipients: Vec<String>,
}

struct CountRow {
    label: String,
    counts: Counts,
}

struct LatestRow {
    suite: String,
    job_id: String,
    link: String,
    status: String,
    started: String,
    tasks_total: u64,
    tasks_pass: u64,
    tasks_failing: u64,
}

struct FailureRow {
    job_id: String,
    link: String,
    suite: String,
    status: String,
    failing_tasks: u64,
    started: String,
    reason: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    branch: String,
    platform: String,
    start: String,
    end: String,
    sha: String,
    totals: Counts,
    suites: Vec<CountRow>,
    days: Vec<CountRow>,
    latest: Vec<LatestRow>,
    failures: Vec<FailureRow>,
}

/// Subject line used for every report mail.
pub fn subject(report: &ReportResult) -> String {
    format!("Teuthology Test Summary - {} - {}", report.end.format("%Y-%m-%d"), report.branch)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn fmt_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Render `report` as an HTML mail for `recipients`.
pub fn render(report: &ReportResult, recipients: &[String], platform: &str) -> Result<ReportMessage, ReportError> {
    let page = ReportTemplate {
        branch: capitalize(&report.branch),
        platform: platform.to_string(),
        start: report.start.format("%Y-%m-%d").to_string(),
        end: report.end.format("%Y-%m-%d").to_string(),
        sha: report.commit_sha.clone().unwrap_or_default(),
        totals: report.totals,
        suites: report
            .by_suite
            .iter()
            .map(|(suite, counts)| CountRow {
                label: suite.clone(),
                counts: *counts,
            })
            .collect(),
        days: report
            .by_day
            .iter()
            .map(|(day, counts)| CountRow {
                label: day.format("%Y-%m-%d").to_string(),
                counts: *counts,
            })
            .collect(),
        latest: report
            .latest_by_suite
            .iter()
            .map(|l| LatestRow {
                suite: l.suite.clone(),
                job_id: l.job_id.clone(),
                link: l.link.clone(),
                status: l.status.to_string(),
                started: fmt_time(l.started_at),
                tasks_total: l.tasks_total,
                tasks_pass: l.tasks_pass,
                tasks_failing: l.tasks_failing,
            })
            .collect(),
        failures: report
            .notable_failures
            .iter()
            .map(|f| FailureRow {
                job_id: f.job_id.clone(),
                link: f.link.clone(),
                suite: f.suite.clone(),
                status: f.status.to_string(),
                failing_tasks: f.failing_tasks,
                started: fmt_time(f.started_at),
                reason: f.reason.clone().unwrap_or_else(|| "-".to_string()),
            })
            .collect(),
    };

    Ok(ReportMessage {
        subject: subject(report),
        html_body: page.render()?,
        recipients: recipients.to_vec(),
    })
}
