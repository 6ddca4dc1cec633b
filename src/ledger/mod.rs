//! Processed-commit ledger.
//!
//! The ledger is the only mutable state shared between scheduled units. It
//! remembers which (commit, suite) pairs have been durably indexed so that a
//! commit is ingested at most once per suite, across process restarts.

pub mod sqlite;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::sqlite::SqliteLedger;

use crate::storage::StorageError;

/// Suite recorded for runs the registry reports without one.
pub const UNKNOWN_SUITE: &str = "unknown";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("ledger query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("ledger worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unrecognised commit status '{0}' in ledger")]
    BadStatus(String),
}

/// Identity of one ledger entry: a commit SHA as seen by one suite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitKey {
    pub sha: String,
    pub suite: String,
}

impl CommitKey {
    pub fn new(sha: impl Into<String>, suite: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            suite: suite.into(),
        }
    }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sha, self.suite)
    }
}

/// Processing status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Pending => "pending",
            CommitStatus::InProgress => "in_progress",
            CommitStatus::Done => "done",
            CommitStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommitStatus::Pending),
            "in_progress" => Ok(CommitStatus::InProgress),
            "done" => Ok(CommitStatus::Done),
            "failed" => Ok(CommitStatus::Failed),
            other => Err(LedgerError::BadStatus(other.to_string())),
        }
    }
}

/// Current state of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub key: CommitKey,
    pub discovered_at: DateTime<Utc>,
    pub status: CommitStatus,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of processed commits.
///
/// Implementations must serialize writes: two ingestion passes racing on the
/// same key must not both be able to claim it.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// True once the key has been marked `Done`.
    async fn has_processed(&self, key: &CommitKey) -> Result<bool, LedgerError>;

    /// Record the outcome of an ingestion attempt for `key`.
    async fn mark_processed(&self, key: &CommitKey, status: CommitStatus) -> Result<(), LedgerError>;

    /// Record first sightings of `keys` as pending. Returns how many were new.
    async fn observe(&self, keys: &[CommitKey]) -> Result<usize, LedgerError>;

    /// `known` minus everything already done, oldest-observed first.
    /// Unseen keys are observed as a side effect.
    async fn pending_commits(&self, known: &BTreeSet<CommitKey>) -> Result<Vec<CommitKey>, LedgerError>;

    /// Move a key to `InProgress` if no other pass holds it and it is not done.
    async fn try_claim(&self, key: &CommitKey) -> Result<bool, LedgerError>;

    /// Read the current record for `key`.
    async fn record(&self, key: &CommitKey) -> Result<Option<CommitRecord>, LedgerError>;
}
