//! Paddles REST client.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{parse_runs, parse_tasks, Page, PageCursor, RawRun, RunSource, Selector, SourceError};
use crate::retry::RetryPolicy;

/// Reads runs from a Paddles server: `{api_url}/runs/<key>/<value>/.../?page=N`.
pub struct PaddlesClient {
    http: Client,
    base: Url,
    retry: RetryPolicy,
    max_pages: u32,
}

impl PaddlesClient {
    pub fn new(api_url: &str, timeout: Duration, max_pages: u32, retry: RetryPolicy) -> Result<Self, SourceError> {
        let base = Url::parse(api_url).map_err(|e| SourceError::Url(format!("{api_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SourceError::Url(api_url.to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("teuthology-metrics/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| SourceError::Transport {
                url: api_url.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base,
            retry,
            max_pages: max_pages.max(1),
        })
    }

    /// Check the registry answers at all. Any HTTP response counts.
    pub async fn ping(&self) -> Result<(), SourceError> {
        let resp = self
            .http
            .head(self.base.clone())
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                url: self.base.to_string(),
                source,
            })?;
        info!(url = %self.base, status = resp.status().as_u16(), "registry reachable");
        Ok(())
    }

    /// Listing URL for one page of `selector`.
    pub fn runs_url(&self, selector: &Selector, cursor: PageCursor) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SourceError::Url(self.base.to_string()))?;
            segments.pop_if_empty().push("runs");
            for (key, value) in selector.segments() {
                segments.push(key).push(&value);
            }
            // Paddles wants the trailing slash.
            segments.push("");
        }
        url.query_pairs_mut().append_pair("page", &cursor.0.to_string());
        Ok(url)
    }

    /// GET `url` as JSON with retries. `Ok(None)` on 404.
    async fn get_json(&self, url: &Url) -> Result<Option<Value>, SourceError> {
        let http = &self.http;
        self.retry.run("registry request", || get_json_once(http, url)).await
    }

    /// Fill in `run.jobs` from its detail link.
    async fn load_tasks(&self, run: &mut RawRun, href: &str) -> Result<(), SourceError> {
        let url = Url::parse(href)
            .or_else(|_| self.base.join(href))
            .map_err(|e| SourceError::Url(format!("{href}: {e}")))?;

        debug!(run = ?run.job_id, %url, "fetching run detail");
        match self.get_json(&url).await? {
            Some(detail) => {
                run.jobs = Some(detail.get("jobs").map(parse_tasks).unwrap_or_default());
            }
            None => {
                warn!(run = ?run.job_id, %url, "run detail not found; indexing without tasks");
                run.jobs = Some(Vec::new());
            }
        }
        Ok(())
    }
}

async fn get_json_once(http: &Client, url: &Url) -> Result<Option<Value>, SourceError> {
    let transport = |source| SourceError::Transport {
        url: url.to_string(),
        source,
    };

    let resp = http.get(url.clone()).send().await.map_err(transport)?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            retry_after,
        });
    }

    let body = resp.bytes().await.map_err(transport)?;
    serde_json::from_slice(&body).map(Some).map_err(|e| SourceError::Decode {
        url: url.to_string(),
        detail: e.to_string(),
    })
}

#[async_trait::async_trait]
impl RunSource for PaddlesClient {
    async fn fetch_page(&self, selector: &Selector, cursor: PageCursor) -> Result<Page, SourceError> {
        let url = self.runs_url(selector, cursor)?;
        debug!(%url, "fetching registry page");

        let Some(body) = self.get_json(&url).await? else {
            debug!(%url, "registry has no runs for selector");
            return Ok(Page::last());
        };

        let (mut runs, malformed) = parse_runs(&body);
        if malformed > 0 {
            warn!(%url, malformed, "skipped malformed items in registry page");
        }

        for run in runs.iter_mut().filter(|r| r.jobs.is_none()) {
            match run.detail_url() {
                Some(href) => self.load_tasks(run, &href).await?,
                None => debug!(run = ?run.job_id, "run has no detail link"),
            }
        }

        let next = if runs.is_empty() || cursor.0 >= self.max_pages {
            None
        } else {
            Some(cursor.next())
        };

        Ok(Page { runs, malformed, next })
    }
}
