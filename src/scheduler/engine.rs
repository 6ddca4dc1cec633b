//! Scheduler loop: fires due jobs, runs units in supervised tasks, collects reports.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::cron::{CronTrigger, InvalidCron, ScheduleEntry};
use super::history::{UnitReport, UnitStatus};
use super::unit::{self, Unit, UnitOutput};
use crate::ledger::CommitKey;
use crate::Services;

/// Reports kept for inspection after the loop ends.
const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Registry user for ingestion and the commit watch.
    pub user: String,
    pub tick: Duration,
    /// Commit watch interval; `None` disables the watch.
    pub poll_interval: Option<Duration>,
    pub unit_timeout: Duration,
    /// How long shutdown waits for in-flight units.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            user: "teuthology".to_string(),
            tick: Duration::from_secs(30),
            poll_interval: Some(Duration::from_secs(900)),
            unit_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

struct Job {
    entry: ScheduleEntry,
    trigger: CronTrigger,
    next: Option<DateTime<Utc>>,
}

struct Completion {
    report: UnitReport,
    discovered: Vec<CommitKey>,
}

/// Cron-driven dispatcher of ingestion, report and watch units.
///
/// Units run in their own tasks; the loop only tracks which keys are busy
/// and collects reports, so a failing or hanging unit cannot stall the
/// others.
pub struct Scheduler {
    services: Services,
    settings: SchedulerSettings,
    jobs: Vec<Job>,
    running: HashSet<String>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    inflight: JoinSet<()>,
    history: VecDeque<UnitReport>,
}

impl Scheduler {
    pub fn new(services: Services, entries: Vec<ScheduleEntry>, settings: SchedulerSettings) -> Result<Self, InvalidCron> {
        let now = Utc::now();
        let mut jobs = Vec::new();
        for entry in entries.into_iter().filter(|e| e.enabled) {
            let trigger = CronTrigger::parse(&entry.cron)?;
            let next = trigger.next_after(now);
            jobs.push(Job { entry, trigger, next });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            services,
            settings,
            jobs,
            running: HashSet::new(),
            tx,
            rx,
            inflight: JoinSet::new(),
            history: VecDeque::new(),
        })
    }

    /// Enabled jobs and their next fire time.
    pub fn next_fires(&self) -> Vec<(&str, Option<DateTime<Utc>>)> {
        self.jobs.iter().map(|j| (j.entry.name.as_str(), j.next)).collect()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running.contains(key)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Most recent unit reports, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &UnitReport> {
        self.history.iter()
    }

    /// Fire every job due at `now`. Missed fire times collapse into one
    /// firing; the next fire is computed from `now`.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let mut due = Vec::new();
        for job in &mut self.jobs {
            if job.next.is_some_and(|t| t <= now) {
                debug!(job = %job.entry.name, scheduled = ?job.next, "job due");
                job.next = job.trigger.next_after(now);
                due.extend(unit::expand(&job.entry, &self.settings.user, today));
            }
        }
        let mut started = 0;
        for unit in due {
            if self.dispatch(unit) {
                started += 1;
            }
        }
        started
    }

    /// Start `unit` in its own task. Returns false, and records a skipped
    /// report, when a unit with the same key is still running.
    pub fn dispatch(&mut self, unit: Unit) -> bool {
        if self.running.contains(&unit.key) {
            warn!(key = %unit.key, origin = %unit.origin, "previous instance still running, skipping");
            let now = Utc::now();
            self.remember(UnitReport {
                unit_id: unit.id,
                key: unit.key,
                origin: unit.origin,
                status: UnitStatus::Skipped,
                summary: "previous instance still running".to_string(),
                started_at: now,
                finished_at: now,
            });
            return false;
        }

        info!(key = %unit.key, kind = unit.kind_name(), origin = %unit.origin, unit_id = %unit.id, "unit started");
        self.running.insert(unit.key.clone());

        let services = self.services.clone();
        let timeout = self.settings.unit_timeout;
        let tx = self.tx.clone();
        self.inflight.spawn(async move {
            let completion = supervise(unit, services, timeout).await;
            // the receiver only goes away when the scheduler is dropped
            let _ = tx.send(completion);
        });
        true
    }

    /// Wait for the next unit to finish and account for it.
    pub async fn next_report(&mut self) -> Option<UnitReport> {
        let completion = self.rx.recv().await?;
        Some(self.complete(completion))
    }

    fn complete(&mut self, completion: Completion) -> UnitReport {
        let Completion { report, discovered } = completion;
        self.running.remove(&report.key);

        match report.status {
            UnitStatus::Success => {
                info!(key = %report.key, elapsed_ms = report.elapsed().num_milliseconds(), summary = %report.summary, "unit finished")
            }
            UnitStatus::Failed | UnitStatus::TimedOut => {
                error!(key = %report.key, status = %report.status, summary = %report.summary, "unit failed")
            }
            UnitStatus::Skipped => {}
        }

        for key in &discovered {
            let unit = Unit::commit(key, Some(self.settings.user.as_str()));
            self.dispatch(unit);
        }

        self.remember(report.clone());
        report
    }

    fn remember(&mut self, report: UnitReport) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(report);
    }

    /// Run until `shutdown` resolves, then wait for in-flight units.
    pub async fn run_until<F>(mut self, shutdown: F) -> Vec<UnitReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            jobs = self.jobs.len(),
            user = %self.settings.user,
            watch = self.settings.poll_interval.is_some(),
            "scheduler started"
        );
        for (name, next) in self.next_fires() {
            debug!(job = name, next = ?next, "next fire");
        }

        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watch = self.settings.poll_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(running = self.running.len(), "shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    self.fire_due(Utc::now());
                }
                _ = next_tick(&mut watch) => {
                    let unit = Unit::watch(&self.settings.user, Utc::now().date_naive());
                    self.dispatch(unit);
                }
                Some(completion) = self.rx.recv() => {
                    self.complete(completion);
                }
                Some(_) = self.inflight.join_next(), if !self.inflight.is_empty() => {}
            }
        }

        self.drain().await;
        self.history.into_iter().collect()
    }

    async fn drain(&mut self) {
        let grace = self.settings.shutdown_grace;
        let waited = tokio::time::timeout(grace, async {
            while self.inflight.join_next().await.is_some() {}
        })
        .await;
        if waited.is_err() {
            warn!(running = self.running.len(), grace_secs = grace.as_secs(), "aborting units still running");
            self.inflight.abort_all();
            while self.inflight.join_next().await.is_some() {}
        }
        while let Ok(completion) = self.rx.try_recv() {
            let Completion { report, .. } = completion;
            self.running.remove(&report.key);
            self.remember(report);
        }
        info!(aborted = self.running.len(), "scheduler stopped");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Run `unit` in a task of its own so a panic or a timeout is contained.
async fn supervise(unit: Unit, services: Services, timeout: Duration) -> Completion {
    let started_at = Utc::now();
    let Unit { id, key, origin, .. } = unit.clone();

    let handle = tokio::spawn(async move { unit.execute(&services).await });
    let abort = handle.abort_handle();

    let (status, summary, discovered) = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(output))) => {
            let status = if output.succeeded() {
                UnitStatus::Success
            } else {
                UnitStatus::Failed
            };
            let summary = output.summary();
            let discovered = match output {
                UnitOutput::Discovered(keys) => keys,
                _ => Vec::new(),
            };
            (status, summary, discovered)
        }
        Ok(Ok(Err(e))) => (UnitStatus::Failed, format!("{e:#}"), Vec::new()),
        Ok(Err(join)) if join.is_panic() => (UnitStatus::Failed, "unit panicked".to_string(), Vec::new()),
        Ok(Err(join)) => (UnitStatus::Failed, join.to_string(), Vec::new()),
        Err(_) => {
            abort.abort();
            (
                UnitStatus::TimedOut,
                format!("no result after {}s", timeout.as_secs_f64()),
                Vec::new(),
            )
        }
    };

    Completion {
        report: UnitReport {
            unit_id: id,
            key,
            origin,
            status,
            summary,
            started_at,
            finished_at: Utc::now(),
        },
        discovered,
    }
}
