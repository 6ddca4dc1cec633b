//! Ingestion pipeline: registry → normalize → index → ledger.
//!
//! One call to [`IngestPipeline::run`] is one pass over a selector. The pass
//! moves through `Start → Fetching → Transforming → Indexing` and ends in
//! `Committed` or `PartialFailure`. A commit is only marked done after every
//! document belonging to it has been written and none of its runs is still
//! running or queued; until then it stays pending for a later pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::index::Indexer;
use crate::ledger::{CommitKey, CommitStatus, Ledger, LedgerError};
use crate::mining::TemplateCatalog;
use crate::source::{RawRun, RunPager, RunSource, Selector, SourceError};
use crate::transform::{self, IndexedDocument};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetching runs failed: {0}")]
    Fetch(#[from] SourceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Fetching,
    Transforming,
    Indexing,
    Committed,
    PartialFailure,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Start => "start",
            Stage::Fetching => "fetching",
            Stage::Transforming => "transforming",
            Stage::Indexing => "indexing",
            Stage::Committed => "committed",
            Stage::PartialFailure => "partial_failure",
        };
        f.write_str(s)
    }
}

/// What one pass did.
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub selector: Selector,
    pub stage: Stage,
    /// Runs returned by the registry.
    pub fetched: usize,
    /// Registry items that were not run objects.
    pub malformed: usize,
    /// Runs rejected by normalization.
    pub data_errors: usize,
    /// Runs belonging to commits already done or claimed elsewhere.
    pub skipped: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Task failure reasons given a template.
    pub templated: usize,
    pub committed: Vec<CommitKey>,
    pub failed_commits: Vec<CommitKey>,
    /// Written, but some runs had not finished; left pending.
    pub unsettled: Vec<CommitKey>,
}

impl PassOutcome {
    fn new(selector: Selector) -> Self {
        Self {
            selector,
            stage: Stage::Start,
            fetched: 0,
            malformed: 0,
            data_errors: 0,
            skipped: 0,
            indexed: 0,
            failed: 0,
            templated: 0,
            committed: Vec::new(),
            failed_commits: Vec::new(),
            unsettled: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Committed
    }
}

impl fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (fetched {}, indexed {}, failed {}, skipped {}, rejected {}, malformed {}, templated {}, commits done {}, commits failed {}, commits unfinished {})",
            self.selector,
            self.stage,
            self.fetched,
            self.indexed,
            self.failed,
            self.skipped,
            self.data_errors,
            self.malformed,
            self.templated,
            self.committed.len(),
            self.failed_commits.len(),
            self.unsettled.len()
        )
    }
}

pub struct IngestPipeline {
    source: Arc<dyn RunSource>,
    indexer: Arc<dyn Indexer>,
    ledger: Arc<dyn Ledger>,
    namespace: String,
    batch_size: usize,
    templates: Option<Arc<TemplateCatalog>>,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn RunSource>,
        indexer: Arc<dyn Indexer>,
        ledger: Arc<dyn Ledger>,
        namespace: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            indexer,
            ledger,
            namespace: namespace.into(),
            batch_size: batch_size.max(1),
            templates: None,
        }
    }

    /// Mine failure reasons of written runs into `templates`.
    pub fn with_templates(mut self, templates: Option<Arc<TemplateCatalog>>) -> Self {
        self.templates = templates;
        self
    }

    /// Run one pass over `selector`.
    ///
    /// Fetch failures abort the pass before the ledger is touched. Index
    /// failures are contained: affected commits are marked failed and
    /// retried by a later pass.
    pub async fn run(&self, selector: &Selector) -> Result<PassOutcome, PipelineError> {
        let mut outcome = PassOutcome::new(selector.clone());
        enter(&mut outcome, Stage::Start);

        // 1. Fetch
        enter(&mut outcome, Stage::Fetching);
        let runs = self.fetch_all(selector, &mut outcome).await?;

        // 2. Normalize
        enter(&mut outcome, Stage::Transforming);
        let docs = self.normalize_all(&runs, &mut outcome);

        // 3. Decide what this pass owns
        let mut by_key: BTreeMap<CommitKey, Vec<IndexedDocument>> = BTreeMap::new();
        let mut unkeyed = Vec::new();
        for doc in docs {
            match doc.commit_key() {
                Some(key) => by_key.entry(key).or_default().push(doc),
                None => unkeyed.push(doc),
            }
        }

        let keys: Vec<CommitKey> = by_key.keys().cloned().collect();
        let fresh = self.ledger.observe(&keys).await?;
        if fresh > 0 {
            debug!(%selector, fresh, "observed new commits");
        }

        let mut claimed = BTreeSet::new();
        let mut to_write = unkeyed;
        for (key, docs) in by_key {
            if self.ledger.has_processed(&key).await? {
                debug!(commit = %key, runs = docs.len(), "commit already ingested");
                outcome.skipped += docs.len();
                continue;
            }
            if !self.ledger.try_claim(&key).await? {
                info!(commit = %key, "commit held by another pass; skipping");
                outcome.skipped += docs.len();
                continue;
            }
            claimed.insert(key);
            to_write.extend(docs);
        }

        // 4. Template failure reasons. A mining error never fails the pass.
        if let Some(templates) = &self.templates {
            match templates.mine_documents(&mut to_write).await {
                Ok(tally) => outcome.templated = tally.mined,
                Err(e) => warn!(%selector, error = %e, "failure templates not mined"),
            }
        }

        // 5. Index
        enter(&mut outcome, Stage::Indexing);
        let failed_ids = self.index_all(&to_write, &mut outcome).await;

        // 6. Settle claimed commits; only fully written, finished commits are done.
        let failed_keys: HashSet<CommitKey> = to_write
            .iter()
            .filter(|d| failed_ids.contains(&d.id))
            .filter_map(IndexedDocument::commit_key)
            .collect();
        let unfinished_keys: HashSet<CommitKey> = to_write
            .iter()
            .filter(|d| d.in_flight)
            .filter_map(IndexedDocument::commit_key)
            .collect();
        for key in claimed {
            if failed_keys.contains(&key) {
                self.ledger.mark_processed(&key, CommitStatus::Failed).await?;
                outcome.failed_commits.push(key);
            } else if unfinished_keys.contains(&key) {
                debug!(commit = %key, "commit has unfinished runs; leaving it pending");
                self.ledger.mark_processed(&key, CommitStatus::Pending).await?;
                outcome.unsettled.push(key);
            } else {
                self.ledger.mark_processed(&key, CommitStatus::Done).await?;
                outcome.committed.push(key);
            }
        }

        let end = if outcome.failed > 0 {
            Stage::PartialFailure
        } else {
            Stage::Committed
        };
        enter(&mut outcome, end);

        if outcome.is_complete() {
            info!(%outcome, "ingestion pass complete");
        } else {
            warn!(%outcome, "ingestion pass partially failed");
        }
        Ok(outcome)
    }

    async fn fetch_all(&self, selector: &Selector, outcome: &mut PassOutcome) -> Result<Vec<RawRun>, PipelineError> {
        let mut pager = RunPager::new(self.source.clone(), selector.clone());
        let mut runs = Vec::new();
        loop {
            let page = match pager.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    warn!(%selector, cursor = ?pager.cursor(), error = %e, "registry fetch failed; abandoning pass");
                    return Err(e.into());
                }
            };
            outcome.malformed += page.malformed;
            runs.extend(page.runs);
        }
        outcome.fetched = runs.len();
        Ok(runs)
    }

    fn normalize_all(&self, runs: &[RawRun], outcome: &mut PassOutcome) -> Vec<IndexedDocument> {
        let mut seen = HashSet::new();
        let mut docs = Vec::with_capacity(runs.len());
        for run in runs {
            match transform::normalize(run, &self.namespace) {
                Ok(doc) => {
                    if seen.insert(doc.id) {
                        docs.push(doc);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "rejecting run");
                    outcome.data_errors += 1;
                }
            }
        }
        docs
    }

    /// Write `docs` in chunks. Returns the ids that failed.
    async fn index_all(&self, docs: &[IndexedDocument], outcome: &mut PassOutcome) -> HashSet<Uuid> {
        let mut failed = HashSet::new();
        for chunk in docs.chunks(self.batch_size) {
            let result = self.indexer.upsert_batch(chunk).await;
            outcome.indexed += result.succeeded();
            for item in result.failed() {
                warn!(id = %item.id, error = item.error.as_deref().unwrap_or(""), "document not indexed");
                failed.insert(item.id);
            }
        }
        outcome.failed = failed.len();
        failed
    }
}

fn enter(outcome: &mut PassOutcome, stage: Stage) {
    debug!(selector = %outcome.selector, %stage, "pipeline stage");
    outcome.stage = stage;
}
