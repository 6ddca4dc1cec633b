//! Commit watch: find commits that still need ingesting.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::ledger::{CommitKey, UNKNOWN_SUITE};
use crate::pipeline::PipelineError;
use crate::source::{RawRun, RunPager, Selector};
use crate::Services;

/// Commit key of a registry run, if it names a commit.
pub fn run_commit_key(run: &RawRun) -> Option<CommitKey> {
    let sha = run.sha1.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let suite = run
        .suite
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SUITE);
    Some(CommitKey::new(sha, suite))
}

/// List `user`'s runs for `date`, record their commit keys and return every
/// key not yet done, oldest first.
pub async fn pending_commits(services: &Services, user: &str, date: NaiveDate) -> Result<Vec<CommitKey>, PipelineError> {
    let selector = Selector {
        user: Some(user.to_string()),
        date: Some(date),
        ..Selector::default()
    };
    debug!(%selector, "commit watch listing runs");

    let mut known = BTreeSet::new();
    let mut runs = Box::pin(RunPager::new(services.source.clone(), selector).into_stream());
    while let Some(run) = runs.try_next().await? {
        if let Some(key) = run_commit_key(&run) {
            known.insert(key);
        }
    }

    let pending = services.ledger.pending_commits(&known).await?;
    info!(user, %date, seen = known.len(), pending = pending.len(), "commit watch finished");
    Ok(pending)
}
