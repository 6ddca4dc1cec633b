//! OpenSearch REST client.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BatchOutcome, IndexError, Indexer, ItemResult, RunFilter, RunQuery};
use crate::retry::RetryPolicy;
use crate::transform::IndexedDocument;

const ERROR_BODY_LIMIT: usize = 512;

/// Connection settings for [`OpenSearchClient`].
#[derive(Debug, Clone)]
pub struct OpenSearchSettings {
    pub url: String,
    pub index: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub max_results: usize,
    pub verify_tls: bool,
}

pub struct OpenSearchClient {
    http: Client,
    base: Url,
    index: String,
    username: String,
    password: String,
    max_results: usize,
    retry: RetryPolicy,
}

impl OpenSearchClient {
    pub fn new(settings: &OpenSearchSettings, retry: RetryPolicy) -> Result<Self, IndexError> {
        let base = Url::parse(&settings.url).map_err(|e| IndexError::Url(format!("{}: {e}", settings.url)))?;
        if base.cannot_be_a_base() {
            return Err(IndexError::Url(settings.url.clone()));
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;
        Ok(Self {
            http,
            base,
            index: settings.index.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            max_results: settings.max_results,
            retry,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    fn endpoint(&self, parts: &[&str]) -> Result<Url, IndexError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(parts);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Send with retries. Success and 404 come back as responses; everything else is an error.
    async fn execute<F>(&self, what: &str, build: F) -> Result<Response, IndexError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.retry.run(what, || send_checked(build())).await
    }

    /// Create the run index with explicit mappings unless it already exists.
    ///
    /// Rejected credentials surface here as [`IndexError::Unauthorized`].
    pub async fn ensure_index(&self) -> Result<(), IndexError> {
        let url = self.endpoint(&[self.index.as_str()])?;
        let resp = self.execute("index lookup", || self.request(Method::HEAD, url.clone())).await?;
        if resp.status() != StatusCode::NOT_FOUND {
            debug!(index = %self.index, "index exists");
            return Ok(());
        }

        let body = index_definition();
        let created = self
            .execute("index creation", || self.request(Method::PUT, url.clone()).json(&body))
            .await;
        match created {
            Ok(_) => {
                info!(index = %self.index, "created search index");
                Ok(())
            }
            // Another process created it between our lookup and create.
            Err(IndexError::Status { status: 400, body, .. }) if body.contains("resource_already_exists_exception") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn send_checked(req: RequestBuilder) -> Result<Response, IndexError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(IndexError::Unauthorized { status: status.as_u16() });
    }

    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let cut = (0..=ERROR_BODY_LIMIT).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
        body.truncate(cut);
    }
    Err(IndexError::Status {
        status: status.as_u16(),
        body,
        retry_after,
    })
}

async fn read_json(resp: Response) -> Result<Value, IndexError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| IndexError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl Indexer for OpenSearchClient {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), IndexError> {
        let id = doc.id.to_string();
        let url = self.endpoint(&[self.index.as_str(), "_doc", id.as_str()])?;
        let body = serde_json::to_vec(doc).map_err(|e| IndexError::Decode(e.to_string()))?;

        let resp = self
            .execute("document upsert", || {
                self.request(Method::PUT, url.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::Status {
                status: 404,
                body: format!("index {} not found", self.index),
                retry_after: None,
            });
        }
        debug!(%id, job = %doc.job_id, "document upserted");
        Ok(())
    }

    async fn upsert_batch(&self, docs: &[IndexedDocument]) -> BatchOutcome {
        if docs.is_empty() {
            return BatchOutcome::default();
        }

        let body = match bulk_body(&self.index, docs) {
            Ok(body) => body,
            Err(e) => return BatchOutcome::all_failed(docs, &e.to_string()),
        };
        let url = match self.endpoint(&["_bulk"]) {
            Ok(url) => url,
            Err(e) => return BatchOutcome::all_failed(docs, &e.to_string()),
        };

        let sent = self
            .execute("bulk upsert", || {
                self.request(Method::POST, url.clone())
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await;
        let reply = match sent {
            Ok(resp) => read_json(resp).await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(reply) => {
                let outcome = parse_bulk_response(docs, &reply);
                let failed = outcome.failed().count();
                if failed > 0 {
                    warn!(index = %self.index, failed, total = docs.len(), "bulk upsert partially failed");
                } else {
                    debug!(index = %self.index, total = docs.len(), "bulk upsert complete");
                }
                outcome
            }
            Err(e) => {
                warn!(index = %self.index, total = docs.len(), error = %e, "bulk upsert failed");
                BatchOutcome::all_failed(docs, &e.to_string())
            }
        }
    }
}

#[async_trait::async_trait]
impl RunQuery for OpenSearchClient {
    async fn search_runs(&self, filter: &RunFilter) -> Result<Vec<IndexedDocument>, IndexError> {
        let url = self.endpoint(&[self.index.as_str(), "_search"])?;
        let body = search_body(filter, self.max_results);

        let resp = self
            .execute("run search", || self.request(Method::POST, url.clone()).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(index = %self.index, "search index does not exist yet");
            return Ok(Vec::new());
        }

        let reply = read_json(resp).await?;
        let docs = parse_hits(&reply);
        debug!(branch = %filter.branch, hits = docs.len(), "run search complete");
        Ok(docs)
    }
}

/// Index settings and mappings for run documents.
pub fn index_definition() -> Value {
    let keyword = json!({"type": "keyword"});
    let date = json!({"type": "date"});
    let count = json!({"type": "long"});
    json!({
        "mappings": {
            "properties": {
                "id": keyword,
                "job_id": keyword,
                "namespace": keyword,
                "branch": keyword,
                "suite": keyword,
                "user": keyword,
                "machine_type": keyword,
                "commit_sha": keyword,
                "status": keyword,
                "run_date": {"type": "date", "format": "yyyy-MM-dd"},
                "scheduled_at": date,
                "started_at": date,
                "updated_at": date,
                "posted_at": date,
                "in_flight": {"type": "boolean"},
                "task_counts": {
                    "properties": {
                        "total": count,
                        "pass": count,
                        "fail": count,
                        "dead": count,
                        "error": count,
                        "unknown": count
                    }
                },
                "tasks": {
                    "type": "nested",
                    "properties": {
                        "name": keyword,
                        "status": keyword,
                        "duration_secs": {"type": "float"},
                        "task_id": keyword,
                        "failure_reason": {"type": "text"},
                        "failure_template": {
                            "properties": {
                                "id": count,
                                "template": keyword
                            }
                        }
                    }
                }
            }
        }
    })
}

/// NDJSON body of `index` actions, one per document.
pub fn bulk_body(index: &str, docs: &[IndexedDocument]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for doc in docs {
        serde_json::to_writer(&mut body, &json!({"index": {"_index": index, "_id": doc.id.to_string()}}))?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, doc)?;
        body.push(b'\n');
    }
    Ok(body)
}

/// Map `_bulk` item statuses back onto the submitted documents.
///
/// Items answer in request order. Anything missing from the reply counts as failed.
pub fn parse_bulk_response(docs: &[IndexedDocument], reply: &Value) -> BatchOutcome {
    let items = reply.get("items").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);

    let results = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let action = items.get(i).and_then(|item| item.get("index"));
            let error = match action {
                None => Some("no result for document in bulk reply".to_string()),
                Some(action) => {
                    let status = action.get("status").and_then(Value::as_u64).unwrap_or(0);
                    if (200..300).contains(&status) {
                        None
                    } else {
                        let reason = action
                            .get("error")
                            .map(|e| {
                                e.get("reason")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                                    .unwrap_or_else(|| e.to_string())
                            })
                            .unwrap_or_else(|| "unknown error".to_string());
                        Some(format!("HTTP {status}: {reason}"))
                    }
                }
            };
            ItemResult { id: doc.id, error }
        })
        .collect();

    BatchOutcome { items: results }
}

/// Bool filter on branch, run date range and optional commit.
pub fn search_body(filter: &RunFilter, size: usize) -> Value {
    let mut clauses = vec![
        json!({"term": {"branch": filter.branch}}),
        json!({"range": {"run_date": {
            "gte": filter.start.format("%Y-%m-%d").to_string(),
            "lte": filter.end.format("%Y-%m-%d").to_string()
        }}}),
    ];
    if let Some(sha) = &filter.commit_sha {
        clauses.push(json!({"term": {"commit_sha": sha}}));
    }
    json!({
        "size": size,
        "sort": [{"started_at": {"order": "desc", "unmapped_type": "date"}}],
        "query": {"bool": {"filter": clauses}}
    })
}

/// Decode `hits.hits[]._source`, skipping documents that no longer match the schema.
pub fn parse_hits(reply: &Value) -> Vec<IndexedDocument> {
    let hits = reply
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    hits.iter()
        .filter_map(|hit| {
            let source = hit.get("_source")?;
            match serde_json::from_value::<IndexedDocument>(source.clone()) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(id = ?hit.get("_id"), error = %e, "skipping undecodable search hit");
                    None
                }
            }
        })
        .collect()
}
