//! Search index access: idempotent document writes and run queries.

pub mod opensearch;

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

pub use self::opensearch::OpenSearchClient;

use crate::retry::{RetryHint, Retryable};
use crate::transform::IndexedDocument;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("search engine rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("search engine returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("unreadable search engine response: {0}")]
    Decode(String),

    #[error("invalid search engine url: {0}")]
    Url(String),
}

impl Retryable for IndexError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            IndexError::Transport(e) if e.is_builder() => RetryHint::Never,
            IndexError::Transport(_) => RetryHint::Backoff,
            IndexError::Status { status: 429, retry_after, .. } => RetryHint::After(*retry_after),
            IndexError::Status { status, .. } if *status == 408 || *status >= 500 => RetryHint::Backoff,
            IndexError::Status { .. } | IndexError::Unauthorized { .. } | IndexError::Decode(_) | IndexError::Url(_) => {
                RetryHint::Never
            }
        }
    }
}

/// Result of writing one document in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub id: Uuid,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-document results of a batch write, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub items: Vec<ItemResult>,
}

impl BatchOutcome {
    /// Every document in `docs` failed for the same reason.
    pub fn all_failed(docs: &[IndexedDocument], reason: &str) -> Self {
        Self {
            items: docs
                .iter()
                .map(|d| ItemResult {
                    id: d.id,
                    error: Some(reason.to_string()),
                })
                .collect(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|i| !i.is_ok())
    }
}

/// Writes documents keyed by their id. Writing the same document twice
/// leaves exactly one stored copy equal to the submitted content.
#[async_trait::async_trait]
pub trait Indexer: Send + Sync {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), IndexError>;

    /// Write `docs` in one request. Failures are reported per document and
    /// never undo the documents that were written.
    async fn upsert_batch(&self, docs: &[IndexedDocument]) -> BatchOutcome;
}

/// Range query for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub branch: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub commit_sha: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, doc: &IndexedDocument) -> bool {
        doc.branch.as_deref() == Some(self.branch.as_str())
            && doc.run_date.is_some_and(|d| d >= self.start && d <= self.end)
            && self
                .commit_sha
                .as_ref()
                .map_or(true, |sha| doc.commit_sha.as_ref() == Some(sha))
    }
}

/// Reads run documents back out of the index.
#[async_trait::async_trait]
pub trait RunQuery: Send + Sync {
    /// Runs matching `filter`, most recently started first. A missing index is not an error.
    async fn search_runs(&self, filter: &RunFilter) -> Result<Vec<IndexedDocument>, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(branch: &str, date: (i32, u32, u32), sha: Option<&str>) -> IndexedDocument {
        IndexedDocument {
            branch: Some(branch.to_string()),
            run_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            commit_sha: sha.map(str::to_string),
            ..IndexedDocument::default()
        }
    }

    #[test]
    fn test_filter_matches_inclusive_range() {
        let filter = RunFilter {
            branch: "main".into(),
            start: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            commit_sha: None,
        };
        assert!(filter.matches(&doc("main", (2024, 5, 1), None)));
        assert!(filter.matches(&doc("main", (2024, 5, 3), Some("abc"))));
        assert!(!filter.matches(&doc("main", (2024, 5, 4), None)));
        assert!(!filter.matches(&doc("reef", (2024, 5, 2), None)));

        let by_sha = RunFilter {
            commit_sha: Some("abc".into()),
            ..filter
        };
        assert!(by_sha.matches(&doc("main", (2024, 5, 2), Some("abc"))));
        assert!(!by_sha.matches(&doc("main", (2024, 5, 2), Some("def"))));
        assert!(!by_sha.matches(&doc("main", (2024, 5, 2), None)));
    }

    #[test]
    fn test_batch_outcome_counts() {
        let docs = vec![IndexedDocument::default(), IndexedDocument::default()];
        let outcome = BatchOutcome::all_failed(&docs, "boom");
        assert_eq!(outcome.succeeded(), 0);
        assert_eq!(outcome.failed().count(), 2);
    }

    #[test]
    fn test_unauthorized_is_not_retried() {
        assert_eq!(IndexError::Unauthorized { status: 401 }.retry_hint(), RetryHint::Never);
        let busy = IndexError::Status {
            status: 503,
            body: String::new(),
            retry_after: None,
        };
        assert_eq!(busy.retry_hint(), RetryHint::Backoff);
    }
}
