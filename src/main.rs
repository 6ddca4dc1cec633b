use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use teuthology_metrics::config::Config;
use teuthology_metrics::notify::parse_recipients;
use teuthology_metrics::report::ReportSpec;
use teuthology_metrics::scheduler::UnitStatus;
use teuthology_metrics::source::Selector;

#[derive(Parser)]
#[command(
    name = "teuthology-metrics",
    about = "Ingest teuthology test runs into OpenSearch and mail summary reports",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "TEUTHOLOGY_METRICS_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. info, debug, teuthology_metrics=trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write a log file into this directory
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion pass
    IngestRuns {
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        suite: Option<String>,

        /// Run date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Commit SHA
        #[arg(long)]
        sha: Option<String>,

        #[arg(long)]
        machine_type: Option<String>,

        #[arg(long)]
        status: Option<String>,

        /// Ledger database (overrides the config)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Do not mine failure reasons into templates
        #[arg(long)]
        skip_failure_templates: bool,
    },

    /// Build and mail a summary report
    SendReport {
        #[arg(long)]
        branch: String,

        /// First day of the range (YYYY-MM-DD)
        #[arg(long)]
        start_date: NaiveDate,

        /// Last day of the range, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end_date: NaiveDate,

        /// Recipient address; repeat or separate with commas
        #[arg(long = "recipient", required = true)]
        recipients: Vec<String>,

        /// Restrict to one commit
        #[arg(long)]
        sha: Option<String>,
    },

    /// Run the scheduler until interrupted
    RunScheduler {
        /// Ledger database (overrides the config)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Registry user (overrides the config)
        #[arg(long)]
        user: Option<String>,
    },

    /// Preview what will run in the next N hours
    PreviewSchedule {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::IngestRuns { .. } => "ingest-runs",
            Commands::SendReport { .. } => "send-report",
            Commands::RunScheduler { .. } => "run-scheduler",
            Commands::PreviewSchedule { .. } => "preview-schedule",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(config_path) = cli.config.as_deref() else {
        bail!("no configuration file given (use --config or TEUTHOLOGY_METRICS_CONFIG)");
    };
    let config = Config::load(config_path)?;

    // Initialize tracing
    let level = cli.log_level.as_deref().or(config.logging.level.as_deref());
    let log_dir = cli.log_path.as_deref().or(config.logging.path.as_deref());
    let log_file = teuthology_metrics::logging::init(level, log_dir, config.logging.json, cli.command.name())?;
    tracing::info!(
        path = %config_path.display(),
        jobs = config.scheduler.jobs.len(),
        log_file = ?log_file,
        "loaded configuration"
    );

    match cli.command {
        Commands::IngestRuns {
            user,
            branch,
            suite,
            date,
            sha,
            machine_type,
            status,
            ledger,
            skip_failure_templates,
        } => {
            let selector = Selector {
                user,
                branch,
                machine_type,
                suite,
                sha,
                date,
                status,
            };
            let outcome =
                teuthology_metrics::ingest(&config, &selector, ledger.as_deref(), skip_failure_templates).await?;
            println!("{outcome}");
            if !outcome.is_complete() {
                bail!(
                    "ingestion partially failed: {} document(s) and {} commit(s) not written",
                    outcome.failed,
                    outcome.failed_commits.len()
                );
            }
        }
        Commands::SendReport {
            branch,
            start_date,
            end_date,
            recipients,
            sha,
        } => {
            let spec = ReportSpec {
                branch,
                start: start_date,
                end: end_date,
                commit_sha: sha,
                recipients: parse_recipients(&recipients),
            };
            let delivery = teuthology_metrics::send_report(&config, &spec)
                .await
                .context("send-report failed")?;
            println!("{delivery}");
        }
        Commands::RunScheduler { ledger, user } => {
            tracing::info!("Starting teuthology-metrics scheduler");
            let reports = teuthology_metrics::run_scheduler(&config, ledger.as_deref(), user.as_deref()).await?;
            let failed = reports
                .iter()
                .filter(|r| matches!(r.status, UnitStatus::Failed | UnitStatus::TimedOut))
                .count();
            tracing::info!(units = reports.len(), failed, "scheduler exited");
        }
        Commands::PreviewSchedule { hours } => {
            let preview = teuthology_metrics::preview_schedule(&config, hours)?;
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for item in preview {
                    println!("{} : {} ({})", item.at.format("%Y-%m-%d %H:%M:%S UTC"), item.name, item.kind);
                }
            }
        }
    }

    Ok(())
}
