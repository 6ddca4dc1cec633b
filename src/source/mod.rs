//! Source registry client: paginated listing of test runs.
//!
//! The registry is read-only from our side. A [`RunSource`] hands back one
//! page at a time; [`RunPager`] walks pages until the registry runs dry and
//! can be resumed from a saved [`PageCursor`].

pub mod paddles;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::Stream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use self::paddles::PaddlesClient;

use crate::retry::{RetryHint, Retryable};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("registry request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("registry returned HTTP {status} for {url}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("unreadable registry response from {url}: {detail}")]
    Decode { url: String, detail: String },

    #[error("invalid registry url: {0}")]
    Url(String),
}

impl Retryable for SourceError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            SourceError::Transport { source, .. } if source.is_builder() => RetryHint::Never,
            SourceError::Transport { .. } => RetryHint::Backoff,
            SourceError::Status { status: 429, retry_after, .. } => RetryHint::After(*retry_after),
            SourceError::Status { status, .. } if *status == 408 || *status >= 500 => RetryHint::Backoff,
            SourceError::Status { .. } | SourceError::Decode { .. } | SourceError::Url(_) => RetryHint::Never,
        }
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Filter for one listing. Every field is optional; an empty selector lists everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub user: Option<String>,
    pub branch: Option<String>,
    pub machine_type: Option<String>,
    pub suite: Option<String>,
    pub sha: Option<String>,
    pub date: Option<NaiveDate>,
    pub status: Option<String>,
}

impl Selector {
    /// Registry path segments as `(key, value)` pairs, in the order the registry expects.
    pub fn segments(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut push = |key: &'static str, value: Option<String>| {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                out.push((key, v));
            }
        };
        push("user", self.user.clone());
        push("branch", self.branch.clone());
        push("machine_type", self.machine_type.clone());
        push("suite", self.suite.clone());
        push("sha1", self.sha.clone());
        push("date", self.date.map(|d| d.format("%Y-%m-%d").to_string()));
        push("status", self.status.clone());
        out
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments = self.segments();
        if segments.is_empty() {
            return f.write_str("all runs");
        }
        let parts: Vec<String> = segments.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Raw payloads
// ---------------------------------------------------------------------------

/// One run as reported by the registry. Only held for the duration of a pass.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRun {
    #[serde(rename = "name", alias = "job_id", default, deserialize_with = "lenient_string")]
    pub job_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub branch: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub suite: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sha1: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub machine_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub scheduled: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub started: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub updated: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub posted: Option<String>,
    /// Detail link; the registry sends either a string or a list of strings.
    #[serde(default)]
    pub href: Option<Value>,
    /// Per-task outcomes. `None` means the listing did not include them.
    #[serde(default, deserialize_with = "lenient_tasks")]
    pub jobs: Option<Vec<RawTask>>,
}

impl RawRun {
    /// First usable detail link, if any.
    pub fn detail_url(&self) -> Option<String> {
        match self.href.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string)),
            _ => None,
        }
    }
}

/// One task (teuthology "job") inside a run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTask {
    #[serde(default, deserialize_with = "lenient_string")]
    pub job_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub failure_reason: Option<String>,
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(scalar_string))
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_tasks<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<RawTask>>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.map(|v| parse_tasks(&v)))
}

/// Decode a task list, dropping anything that is not an object.
pub fn parse_tasks(value: &Value) -> Vec<RawTask> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item.is_object())
        .filter_map(|item| RawTask::deserialize(item).ok())
        .collect()
}

/// Decode one listing body. Returns the runs and the number of malformed items.
///
/// The registry answers with a bare array; an object with a `runs` array is
/// accepted too.
pub fn parse_runs(body: &Value) -> (Vec<RawRun>, usize) {
    let items = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("runs") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return (Vec::new(), 1),
        },
        _ => return (Vec::new(), 1),
    };

    let mut runs = Vec::with_capacity(items.len());
    let mut malformed = 0;
    for item in items {
        match item {
            Value::Object(_) => match RawRun::deserialize(item) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    debug!(error = %e, "skipping undecodable run");
                    malformed += 1;
                }
            },
            _ => malformed += 1,
        }
    }
    (runs, malformed)
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// Position in a listing. Pages are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageCursor(pub u32);

impl PageCursor {
    pub const FIRST: PageCursor = PageCursor(1);

    pub fn next(self) -> PageCursor {
        PageCursor(self.0.saturating_add(1))
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub runs: Vec<RawRun>,
    /// Items in the body that were not run objects.
    pub malformed: usize,
    /// Where to continue, or `None` when this was the last page.
    pub next: Option<PageCursor>,
}

impl Page {
    pub fn last() -> Self {
        Self::default()
    }
}

/// Anything that can list runs one page at a time.
#[async_trait::async_trait]
pub trait RunSource: Send + Sync {
    async fn fetch_page(&self, selector: &Selector, cursor: PageCursor) -> Result<Page, SourceError>;
}

/// Walks a listing page by page.
///
/// The listing ends on an empty page, on a page whose run names were all
/// seen before (some registries repeat the last page forever), or when the
/// source reports no next cursor.
pub struct RunPager {
    source: Arc<dyn RunSource>,
    selector: Selector,
    cursor: Option<PageCursor>,
    seen: HashSet<String>,
}

impl RunPager {
    pub fn new(source: Arc<dyn RunSource>, selector: Selector) -> Self {
        Self::resume(source, selector, PageCursor::FIRST)
    }

    pub fn resume(source: Arc<dyn RunSource>, selector: Selector, cursor: PageCursor) -> Self {
        Self {
            source,
            selector,
            cursor: Some(cursor),
            seen: HashSet::new(),
        }
    }

    /// Next page to be fetched, or `None` once the listing is exhausted.
    pub fn cursor(&self) -> Option<PageCursor> {
        self.cursor
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Fetch the next page. `Ok(None)` once the listing is exhausted.
    ///
    /// On error the cursor is left in place, so calling again retries the same page.
    pub async fn next_page(&mut self) -> Result<Option<Page>, SourceError> {
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        let page = self.source.fetch_page(&self.selector, cursor).await?;

        if page.runs.is_empty() && page.malformed == 0 {
            self.cursor = None;
            return Ok(None);
        }

        let mut fresh = 0usize;
        for run in &page.runs {
            match &run.job_id {
                Some(name) => {
                    if self.seen.insert(name.clone()) {
                        fresh += 1;
                    }
                }
                None => fresh += 1,
            }
        }
        if fresh == 0 && page.malformed == 0 {
            warn!(selector = %self.selector, %cursor, "registry repeated an earlier page; stopping");
            self.cursor = None;
            return Ok(None);
        }

        debug!(selector = %self.selector, %cursor, runs = page.runs.len(), malformed = page.malformed, "page fetched");
        self.cursor = page.next;
        Ok(Some(page))
    }

    /// Flatten the remaining pages into a stream of runs.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawRun, SourceError>> + Send {
        futures::stream::try_unfold((self, VecDeque::new()), |(pager, buffered)| advance(pager, buffered))
    }
}

type StreamState = (RunPager, VecDeque<RawRun>);

async fn advance(mut pager: RunPager, mut buffered: VecDeque<RawRun>) -> Result<Option<(RawRun, StreamState)>, SourceError> {
    loop {
        if let Some(run) = buffered.pop_front() {
            return Ok(Some((run, (pager, buffered))));
        }
        match pager.next_page().await? {
            Some(page) => buffered.extend(page.runs),
            None => return Ok(None),
        }
    }
}
