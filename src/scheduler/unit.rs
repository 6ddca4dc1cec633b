//! Units of scheduled work.
//!
//! A schedule entry expands into one or more units when it fires. Each unit
//! carries a key; the scheduler never runs two units with the same key at
//! the same time.

use std::fmt;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::cron::{ScheduleEntry, ScheduledTask};
use super::watch;
use crate::ledger::{CommitKey, UNKNOWN_SUITE};
use crate::notify::parse_recipients;
use crate::pipeline::PassOutcome;
use crate::report::ReportSpec;
use crate::source::Selector;
use crate::{Delivery, Services};

/// Why a unit exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitOrigin {
    /// Fired by a configured job.
    Schedule { job: String },
    /// Discovered by the commit watch.
    Watch,
}

impl fmt::Display for UnitOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOrigin::Schedule { job } => write!(f, "schedule:{job}"),
            UnitOrigin::Watch => f.write_str("watch"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UnitKind {
    Ingest(Selector),
    Report(ReportSpec),
    /// List `user`'s runs for `date` and return commits still pending.
    Watch { user: String, date: NaiveDate },
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub id: Uuid,
    pub key: String,
    pub origin: UnitOrigin,
    pub kind: UnitKind,
}

impl Unit {
    fn new(key: String, origin: UnitOrigin, kind: UnitKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            origin,
            kind,
        }
    }

    /// Scheduled ingestion of one (suite, branch).
    pub fn ingest(job: &str, selector: Selector) -> Self {
        let key = format!(
            "ingest:{}:{}",
            selector.suite.as_deref().unwrap_or("*"),
            selector.branch.as_deref().unwrap_or("*")
        );
        Self::new(key, UnitOrigin::Schedule { job: job.to_string() }, UnitKind::Ingest(selector))
    }

    /// Ad-hoc ingestion of one pending commit.
    pub fn commit(commit: &CommitKey, user: Option<&str>) -> Self {
        let selector = Selector {
            user: user.map(str::to_string),
            sha: Some(commit.sha.clone()),
            // runs without a suite cannot be selected by suite
            suite: (commit.suite != UNKNOWN_SUITE).then(|| commit.suite.clone()),
            ..Selector::default()
        };
        Self::new(format!("commit:{commit}"), UnitOrigin::Watch, UnitKind::Ingest(selector))
    }

    pub fn report(job: &str, spec: ReportSpec) -> Self {
        Self::new(
            format!("report:{job}"),
            UnitOrigin::Schedule { job: job.to_string() },
            UnitKind::Report(spec),
        )
    }

    pub fn watch(user: &str, date: NaiveDate) -> Self {
        Self::new(
            "watch".to_string(),
            UnitOrigin::Watch,
            UnitKind::Watch {
                user: user.to_string(),
                date,
            },
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            UnitKind::Ingest(_) => "ingest",
            UnitKind::Report(_) => "report",
            UnitKind::Watch { .. } => "watch",
        }
    }

    /// Run the unit to completion.
    pub async fn execute(&self, services: &Services) -> Result<UnitOutput> {
        match &self.kind {
            UnitKind::Ingest(selector) => {
                let outcome = services
                    .pipeline()
                    .run(selector)
                    .await
                    .with_context(|| format!("ingest of {selector} failed"))?;
                Ok(UnitOutput::Ingested(outcome))
            }
            UnitKind::Report(spec) => {
                let delivery = services.deliver_report(spec).await?;
                Ok(UnitOutput::Reported(delivery))
            }
            UnitKind::Watch { user, date } => {
                let pending = watch::pending_commits(services, user, *date)
                    .await
                    .context("commit watch failed")?;
                Ok(UnitOutput::Discovered(pending))
            }
        }
    }
}

/// What a finished unit produced.
#[derive(Debug, Clone)]
pub enum UnitOutput {
    Ingested(PassOutcome),
    Reported(Delivery),
    Discovered(Vec<CommitKey>),
}

impl UnitOutput {
    /// A partially failed ingestion counts as a failed unit.
    pub fn succeeded(&self) -> bool {
        match self {
            UnitOutput::Ingested(outcome) => outcome.is_complete(),
            UnitOutput::Reported(_) | UnitOutput::Discovered(_) => true,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            UnitOutput::Ingested(outcome) => outcome.to_string(),
            UnitOutput::Reported(delivery) => delivery.to_string(),
            UnitOutput::Discovered(keys) => format!("{} pending commit(s)", keys.len()),
        }
    }
}

/// Units for one firing of `entry` on `today` (UTC).
pub fn expand(entry: &ScheduleEntry, default_user: &str, today: NaiveDate) -> Vec<Unit> {
    match &entry.task {
        ScheduledTask::Ingest {
            suites,
            branches,
            user,
            machine_type,
        } => {
            let user = user.clone().unwrap_or_else(|| default_user.to_string());
            let branches: Vec<Option<String>> = if branches.is_empty() {
                vec![None]
            } else {
                branches.iter().cloned().map(Some).collect()
            };
            let mut units = Vec::new();
            for suite in suites.iter().filter(|s| !s.trim().is_empty()) {
                for branch in &branches {
                    let selector = Selector {
                        user: Some(user.clone()),
                        branch: branch.clone(),
                        machine_type: machine_type.clone(),
                        suite: Some(suite.clone()),
                        date: Some(today),
                        ..Selector::default()
                    };
                    units.push(Unit::ingest(&entry.name, selector));
                }
            }
            units
        }
        ScheduledTask::Report {
            branch,
            recipients,
            days,
            commit_sha,
        } => {
            let span = u64::from((*days).max(1)) - 1;
            let Some(start) = today.checked_sub_days(Days::new(span)) else {
                warn!(job = %entry.name, days, "report range starts before the supported calendar, skipping");
                return Vec::new();
            };
            let spec = ReportSpec {
                branch: branch.clone(),
                start,
                end: today,
                commit_sha: commit_sha.clone(),
                recipients: parse_recipients(recipients),
            };
            vec![Unit::report(&entry.name, spec)]
        }
    }
}
