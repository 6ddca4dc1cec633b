//! teuthology-metrics -- test-run ingestion and reporting for teuthology.
//!
//! Pulls run results from the Paddles registry, indexes them into
//! OpenSearch, records processed commits in a SQLite ledger, and mails HTML
//! summaries on a cron schedule.

pub mod config;
pub mod index;
pub mod ledger;
pub mod logging;
pub mod mining;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod transform;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::config::{Config, ReportConfig};
use crate::index::opensearch::OpenSearchClient;
use crate::index::{Indexer, RunQuery};
use crate::ledger::{Ledger, SqliteLedger};
use crate::mining::TemplateCatalog;
use crate::notify::{Mailer, SmtpMailer};
use crate::pipeline::{IngestPipeline, PassOutcome};
use crate::report::ReportSpec;
use crate::scheduler::{PreviewItem, Scheduler, SchedulerSettings, UnitReport};
use crate::source::{PaddlesClient, RunSource, Selector};

/// What happened to one report request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { runs: u64, recipients: usize },
    /// Nothing matched and `report.skip_empty` is set.
    SkippedEmpty,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Sent { runs, recipients } => write!(f, "report of {runs} run(s) sent to {recipients} recipient(s)"),
            Delivery::SkippedEmpty => f.write_str("empty report not sent"),
        }
    }
}

/// Connected clients shared by every unit of work.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn RunSource>,
    pub indexer: Arc<dyn Indexer>,
    pub query: Arc<dyn RunQuery>,
    pub ledger: Arc<dyn Ledger>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub namespace: String,
    pub batch_size: usize,
    pub report: ReportConfig,
    /// Failure-template catalog; `None` when mining is off.
    pub templates: Option<Arc<TemplateCatalog>>,
}

impl Services {
    /// Connect every client named in `config` around an open ledger.
    ///
    /// Fails when the search engine rejects the credentials. With
    /// `mine_templates`, the failure-template catalog is loaded from the
    /// ledger database.
    pub async fn connect(config: &Config, ledger: SqliteLedger, mine_templates: bool) -> Result<Self> {
        let source = registry_client(config)?;

        let templates = if mine_templates {
            let catalog = TemplateCatalog::open(ledger.pool().clone(), &config.mining)
                .await
                .context("failed to load failure templates")?;
            Some(Arc::new(catalog))
        } else {
            info!("failure-template mining disabled");
            None
        };

        let search = Arc::new(
            OpenSearchClient::new(&config.search.settings(), config.retry.clone())
                .context("failed to build search client")?,
        );
        search
            .ensure_index()
            .await
            .with_context(|| format!("failed to prepare index '{}'", search.index()))?;

        let mailer: Option<Arc<dyn Mailer>> = match &config.email {
            Some(email) => Some(Arc::new(
                SmtpMailer::new(&email.settings()).context("failed to build mail transport")?,
            )),
            None => None,
        };

        Ok(Self {
            source: Arc::new(source),
            indexer: search.clone(),
            query: search,
            ledger: Arc::new(ledger),
            mailer,
            namespace: config.source.namespace.clone(),
            batch_size: config.search.batch_size,
            report: config.report.clone(),
            templates,
        })
    }

    pub fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(
            self.source.clone(),
            self.indexer.clone(),
            self.ledger.clone(),
            self.namespace.clone(),
            self.batch_size,
        )
        .with_templates(self.templates.clone())
    }

    pub async fn deliver_report(&self, spec: &ReportSpec) -> Result<Delivery> {
        deliver_report(self.query.as_ref(), self.mailer.as_deref(), &self.report, spec).await
    }
}

/// Build, render and mail the report for `spec`.
pub async fn deliver_report(
    query: &dyn RunQuery,
    mailer: Option<&dyn Mailer>,
    settings: &ReportConfig,
    spec: &ReportSpec,
) -> Result<Delivery> {
    if spec.recipients.is_empty() {
        bail!("report for branch '{}' has no recipients", spec.branch);
    }
    if settings.results_server.trim().is_empty() {
        bail!("report.results_server must be set to send reports");
    }

    let report = report::build_report(query, spec, &settings.results_server, settings.notable_failures)
        .await
        .with_context(|| format!("failed to build report for branch '{}'", spec.branch))?;

    if report.is_empty() && settings.skip_empty {
        info!(branch = %spec.branch, start = %spec.start, end = %spec.end, "no runs in range, report not sent");
        return Ok(Delivery::SkippedEmpty);
    }

    let message = report::render(&report, &spec.recipients, &settings.platform).context("failed to render report")?;
    let mailer = mailer.context("no [email] section configured")?;
    mailer
        .send(&message)
        .await
        .with_context(|| format!("failed to mail '{}'", message.subject))?;

    Ok(Delivery::Sent {
        runs: report.totals.total,
        recipients: message.recipients.len(),
    })
}

fn registry_client(config: &Config) -> Result<PaddlesClient> {
    PaddlesClient::new(
        &config.source.api_url,
        config.source.timeout(),
        config.source.max_pages,
        config.retry.clone(),
    )
    .context("failed to build registry client")
}

fn open_ledger(config: &Config, override_path: Option<&Path>) -> Result<SqliteLedger> {
    let path = override_path.unwrap_or(&config.ledger.path);
    SqliteLedger::open(path).with_context(|| format!("failed to open ledger {}", path.display()))
}

/// One ingestion pass over `selector`.
pub async fn ingest(
    config: &Config,
    selector: &Selector,
    ledger_path: Option<&Path>,
    skip_failure_templates: bool,
) -> Result<PassOutcome> {
    // 1. Ledger
    let ledger = open_ledger(config, ledger_path)?;

    // 2. Registry reachability
    registry_client(config)?
        .ping()
        .await
        .with_context(|| format!("registry {} is unreachable", config.source.api_url))?;

    // 3. Clients
    let services = Services::connect(config, ledger, config.mining.enabled && !skip_failure_templates).await?;

    // 4. Pass
    info!(%selector, "starting ingestion");
    services
        .pipeline()
        .run(selector)
        .await
        .with_context(|| format!("ingestion of {selector} failed"))
}

/// Build and mail one report.
pub async fn send_report(config: &Config, spec: &ReportSpec) -> Result<Delivery> {
    let Some(email) = &config.email else {
        bail!("no [email] section configured");
    };
    let search = OpenSearchClient::new(&config.search.settings(), config.retry.clone())
        .context("failed to build search client")?;
    let mailer = SmtpMailer::new(&email.settings()).context("failed to build mail transport")?;

    let delivery = deliver_report(&search, Some(&mailer), &config.report, spec).await?;
    info!(branch = %spec.branch, result = %delivery, "report done");
    Ok(delivery)
}

/// Run the scheduler until SIGINT or SIGTERM.
pub async fn run_scheduler(config: &Config, ledger_path: Option<&Path>, user: Option<&str>) -> Result<Vec<UnitReport>> {
    // 1. Ledger; claims outlive a unit only as long as it may run
    let ledger = open_ledger(config, ledger_path)?.with_claim_lease(config.scheduler.unit_timeout());
    ledger
        .release_stale_claims()
        .await
        .context("failed to release stale ledger claims")?;

    // 2. Clients
    let services = Services::connect(config, ledger, config.mining.enabled).await?;

    // 3. Scheduler
    let settings = SchedulerSettings {
        user: user.unwrap_or(&config.scheduler.user).to_string(),
        tick: config.scheduler.tick(),
        poll_interval: config.scheduler.poll_interval(),
        unit_timeout: config.scheduler.unit_timeout(),
        ..SchedulerSettings::default()
    };
    let jobs = config.effective_jobs();
    if config.scheduler.jobs.is_empty() {
        info!("no jobs configured, using the default profile");
    }
    let scheduler = Scheduler::new(services, jobs, settings)?;

    // 4. Loop
    Ok(scheduler.run_until(shutdown_signal()).await)
}

/// Upcoming fire times of the configured jobs.
pub fn preview_schedule(config: &Config, hours: u64) -> Result<Vec<PreviewItem>> {
    Ok(scheduler::preview(&config.effective_jobs(), Utc::now(), hours)?)
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received interrupt"),
        _ = terminate => info!("received terminate"),
    }
}
