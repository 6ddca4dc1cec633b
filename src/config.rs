//! TOML configuration.
//!
//! Loaded once at process start and validated before anything connects.
//! Sections with required keys (`[source]`, `[search]`) must be present;
//! everything else falls back to defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::opensearch::OpenSearchSettings;
use crate::notify::{parse_recipients, SmtpSettings};
use crate::retry::RetryPolicy;
use crate::scheduler::cron::{CronTrigger, ScheduleEntry, ScheduledTask};

/// Longest range a scheduled report may cover.
pub const MAX_REPORT_DAYS: u32 = 366;

/// Overrides `[search] password`.
pub const SEARCH_PASSWORD_ENV: &str = "TEUTHOLOGY_METRICS_SEARCH_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read, apply environment overrides, and validate.
    ///
    /// Runs before logging is set up, so it does not log.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(SEARCH_PASSWORD_ENV) {
            if !password.is_empty() {
                self.search.password = password;
            }
        }
    }

    /// Fail fast on anything that would only break later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("source.api_url", &self.source.api_url)?;
        if self.source.namespace.trim().is_empty() {
            return Err(invalid("source.namespace must not be empty"));
        }

        check_url("search.url", &self.search.url)?;
        if self.search.username.trim().is_empty() || self.search.password.is_empty() {
            return Err(invalid("search.username and search.password are required"));
        }
        if self.search.index.trim().is_empty() {
            return Err(invalid("search.index must not be empty"));
        }
        if self.search.batch_size == 0 || self.search.max_results == 0 {
            return Err(invalid("search.batch_size and search.max_results must be at least 1"));
        }

        if let Some(email) = &self.email {
            if email.host.trim().is_empty() || email.sender.trim().is_empty() {
                return Err(invalid("email.host and email.sender are required"));
            }
            if email.username.is_some() != email.password.is_some() {
                return Err(invalid("email.username and email.password must be set together"));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }

        self.scheduler.validate()?;
        self.mining.validate()?;

        let has_reports = self
            .scheduler
            .jobs
            .iter()
            .any(|j| matches!(j.task, ScheduledTask::Report { .. }));
        if has_reports {
            if self.email.is_none() {
                return Err(invalid("report jobs are configured but [email] is missing"));
            }
            if self.report.results_server.trim().is_empty() {
                return Err(invalid("report jobs are configured but report.results_server is empty"));
            }
        }
        Ok(())
    }

    /// Scheduler jobs, or the built-in profile when none are configured.
    pub fn effective_jobs(&self) -> Vec<ScheduleEntry> {
        if self.scheduler.jobs.is_empty() {
            crate::scheduler::profiles::defaults()
        } else {
            self.scheduler.jobs.clone()
        }
    }
}

fn check_url(key: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| invalid(format!("{key} '{value}' is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("{key} must use http or https, not '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Base URL of the Paddles API.
    pub api_url: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Namespace mixed into document ids.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_source_timeout() -> u64 {
    10
}

fn default_namespace() -> String {
    "teuthology".to_string()
}

fn default_max_pages() -> u32 {
    100
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Search engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_index() -> String {
    "teuthology-runs".to_string()
}

fn default_search_timeout() -> u64 {
    180
}

fn default_batch_size() -> usize {
    500
}

fn default_max_results() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl SearchConfig {
    pub fn settings(&self) -> OpenSearchSettings {
        OpenSearchSettings {
            url: self.url.clone(),
            index: self.index.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_results: self.max_results,
            verify_tls: self.verify_tls,
        }
    }
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub sender: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub starttls: bool,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> u64 {
    30
}

impl EmailConfig {
    pub fn settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.host.clone(),
            port: self.port,
            sender: self.sender.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            starttls: self.starttls,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Run links in reports point at `<results_server>/<job id>`.
    pub results_server: String,
    pub platform: String,
    pub notable_failures: usize,
    /// Do not mail reports with no runs.
    pub skip_empty: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            results_server: String::new(),
            platform: "OpenStack".to_string(),
            notable_failures: 10,
            skip_empty: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ledger.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Registry user for scheduled ingestion and the commit watch.
    pub user: String,
    pub tick_secs: u64,
    /// Commit watch interval. Zero disables the watch.
    pub poll_interval_secs: u64,
    /// Units running longer than this are aborted.
    pub unit_timeout_secs: u64,
    pub jobs: Vec<ScheduleEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            user: "teuthology".to_string(),
            tick_secs: 30,
            poll_interval_secs: 900,
            unit_timeout_secs: 3600,
            jobs: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_secs == 0 || self.unit_timeout_secs == 0 {
            return Err(invalid("scheduler.tick_secs and scheduler.unit_timeout_secs must be at least 1"));
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(invalid("scheduler job with empty name"));
            }
            if !names.insert(job.name.as_str()) {
                return Err(invalid(format!("duplicate scheduler job name '{}'", job.name)));
            }
            CronTrigger::parse(&job.cron).map_err(|e| invalid(format!("job '{}': {e}", job.name)))?;

            match &job.task {
                ScheduledTask::Ingest { suites, .. } => {
                    if suites.iter().all(|s| s.trim().is_empty()) {
                        return Err(invalid(format!("ingest job '{}' lists no suites", job.name)));
                    }
                }
                ScheduledTask::Report {
                    branch,
                    recipients,
                    days,
                    ..
                } => {
                    if branch.trim().is_empty() {
                        return Err(invalid(format!("report job '{}' has no branch", job.name)));
                    }
                    if parse_recipients(recipients).is_empty() {
                        return Err(invalid(format!("report job '{}' has no recipients", job.name)));
                    }
                    if *days == 0 || *days > MAX_REPORT_DAYS {
                        return Err(invalid(format!(
                            "report job '{}': days must be between 1 and {MAX_REPORT_DAYS}",
                            job.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Failure-template mining
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiningConfig {
    /// Mine task failure reasons into templates during ingestion.
    pub enabled: bool,
    /// Share of equal tokens needed to join an existing template.
    pub similarity: f64,
    /// Prefix tree depth, counting the length layer and the leaf.
    pub depth: usize,
    /// Children per tree node before new tokens share a wildcard branch.
    pub max_children: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity: 0.8,
            depth: 4,
            max_children: 100,
        }
    }
}

impl MiningConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.similarity > 0.0 && self.similarity <= 1.0) {
            return Err(invalid("mining.similarity must be greater than 0 and at most 1"));
        }
        if self.depth < 3 {
            return Err(invalid("mining.depth must be at least 3"));
        }
        if self.max_children < 2 {
            return Err(invalid("mining.max_children must be at least 2"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `teuthology_metrics=debug`.
    pub level: Option<String>,
    /// Directory for per-command log files.
    pub path: Option<PathBuf>,
    /// JSON lines on stderr.
    pub json: bool,
}
