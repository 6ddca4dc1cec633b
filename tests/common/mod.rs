//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use teuthology_metrics::config::{MiningConfig, ReportConfig};
use teuthology_metrics::index::{BatchOutcome, IndexError, Indexer, ItemResult, RunFilter, RunQuery};
use teuthology_metrics::ledger::{CommitKey, CommitRecord, CommitStatus, Ledger, LedgerError, SqliteLedger};
use teuthology_metrics::mining::TemplateCatalog;
use teuthology_metrics::notify::{Mailer, NotifyError};
use teuthology_metrics::report::ReportMessage;
use teuthology_metrics::source::{parse_runs, Page, PageCursor, RawRun, RunSource, Selector, SourceError};
use teuthology_metrics::transform::IndexedDocument;
use teuthology_metrics::Services;

pub const RESULTS_SERVER: &str = "https://pulpito.example.com";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// One registry run with inline tasks, started on 2024-05-01.
pub fn run_json(name: &str, suite: &str, sha: &str, status: &str) -> Value {
    let task_status = if status == "pass" { "pass" } else { "fail" };
    json!({
        "name": name,
        "branch": "main",
        "suite": suite,
        "user": "teuthology",
        "sha1": sha,
        "status": status,
        "machine_type": "smithi",
        "scheduled": "2024-05-01 09:00:00",
        "started": "2024-05-01 10:00:00",
        "posted": "2024-05-01 08:59:00",
        "jobs": [
            {"job_id": "1", "description": format!("{suite}/basic"), "status": "pass", "duration": 120},
            {"job_id": "2", "description": format!("{suite}/extra"), "status": task_status, "duration": "95.5"}
        ]
    })
}

/// Ten runs of `sha` on suite smoke: nine pass, the last one fails.
pub fn nine_pass_one_fail(sha: &str) -> Vec<Value> {
    (1..=10)
        .map(|i| {
            let status = if i == 10 { "fail" } else { "pass" };
            run_json(&format!("run-{i:02}"), "smoke", sha, status)
        })
        .collect()
}

/// One run of `sha` on suite smoke carrying ten inline tasks, the last of
/// which failed on a test node.
pub fn one_run_ten_tasks(sha: &str) -> Value {
    let jobs: Vec<Value> = (1..=10)
        .map(|i| {
            if i == 10 {
                json!({
                    "job_id": i.to_string(),
                    "description": format!("smoke/basic/{i:02}"),
                    "status": "fail",
                    "duration": 300,
                    "failure_reason": "Command failed on smithi042 with status 1: 'sudo ceph health'"
                })
            } else {
                json!({"job_id": i.to_string(), "description": format!("smoke/basic/{i:02}"), "status": "pass", "duration": 60})
            }
        })
        .collect();
    json!({
        "name": "run-01",
        "branch": "main",
        "suite": "smoke",
        "user": "teuthology",
        "sha1": sha,
        "machine_type": "smithi",
        "scheduled": "2024-05-01 09:00:00",
        "started": "2024-05-01 10:00:00",
        "jobs": jobs
    })
}

pub fn ledger(dir: &Path) -> SqliteLedger {
    SqliteLedger::open(&dir.join("ledger.db")).unwrap()
}

pub fn report_config() -> ReportConfig {
    ReportConfig {
        results_server: RESULTS_SERVER.to_string(),
        ..ReportConfig::default()
    }
}

pub fn services(source: Arc<FakeSource>, index: Arc<FakeIndex>, ledger: SqliteLedger, mailer: Arc<FakeMailer>) -> Services {
    Services {
        source,
        indexer: index.clone(),
        query: index,
        ledger: Arc::new(ledger),
        mailer: Some(mailer as Arc<dyn Mailer>),
        namespace: "teuthology".to_string(),
        batch_size: 4,
        report: report_config(),
        templates: None,
    }
}

pub async fn templates(ledger: &SqliteLedger) -> Arc<TemplateCatalog> {
    Arc::new(
        TemplateCatalog::open(ledger.pool().clone(), &MiningConfig::default())
            .await
            .unwrap(),
    )
}

// ---------------------------------------------------------------------------
// Registry fake
// ---------------------------------------------------------------------------

/// In-memory registry. Filters on user, branch, suite and sha like Paddles does.
pub struct FakeSource {
    runs: Mutex<Vec<Value>>,
    page_size: usize,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub panic: AtomicBool,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new(runs: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs),
            page_size: 3,
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
            panic: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, run: Value) {
        self.runs.lock().unwrap().push(run);
    }

    /// Replace what the registry returns, as when runs progress.
    pub fn set_runs(&self, runs: Vec<Value>) {
        *self.runs.lock().unwrap() = runs;
    }
}

fn selected(selector: &Selector, run: &RawRun) -> bool {
    let eq = |want: &Option<String>, have: &Option<String>| want.is_none() || want == have;
    eq(&selector.user, &run.user)
        && eq(&selector.branch, &run.branch)
        && eq(&selector.suite, &run.suite)
        && eq(&selector.sha, &run.sha1)
}

#[async_trait::async_trait]
impl RunSource for FakeSource {
    async fn fetch_page(&self, selector: &Selector, cursor: PageCursor) -> Result<Page, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic.load(Ordering::SeqCst) {
            panic!("registry fake asked to panic");
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::Status {
                url: "fake://runs".to_string(),
                status: 503,
                retry_after: None,
            });
        }

        let body = Value::Array(self.runs.lock().unwrap().clone());
        let (runs, _) = parse_runs(&body);
        let runs: Vec<RawRun> = runs.into_iter().filter(|r| selected(selector, r)).collect();

        let start = (cursor.0 as usize - 1) * self.page_size;
        let page: Vec<RawRun> = runs.iter().skip(start).take(self.page_size).cloned().collect();
        let next = (start + self.page_size < runs.len()).then(|| cursor.next());
        Ok(Page {
            runs: page,
            malformed: 0,
            next,
        })
    }
}

// ---------------------------------------------------------------------------
// Ledger wrapper
// ---------------------------------------------------------------------------

/// Real ledger that counts how often each key is marked done.
pub struct CountingLedger {
    inner: SqliteLedger,
    pub done: Mutex<BTreeMap<CommitKey, usize>>,
}

impl CountingLedger {
    pub fn new(inner: SqliteLedger) -> Arc<Self> {
        Arc::new(Self {
            inner,
            done: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn done_count(&self, key: &CommitKey) -> usize {
        self.done.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Ledger for CountingLedger {
    async fn has_processed(&self, key: &CommitKey) -> Result<bool, LedgerError> {
        self.inner.has_processed(key).await
    }

    async fn mark_processed(&self, key: &CommitKey, status: CommitStatus) -> Result<(), LedgerError> {
        self.inner.mark_processed(key, status).await?;
        if status == CommitStatus::Done {
            *self.done.lock().unwrap().entry(key.clone()).or_default() += 1;
        }
        Ok(())
    }

    async fn observe(&self, keys: &[CommitKey]) -> Result<usize, LedgerError> {
        self.inner.observe(keys).await
    }

    async fn pending_commits(&self, known: &BTreeSet<CommitKey>) -> Result<Vec<CommitKey>, LedgerError> {
        self.inner.pending_commits(known).await
    }

    async fn try_claim(&self, key: &CommitKey) -> Result<bool, LedgerError> {
        self.inner.try_claim(key).await
    }

    async fn record(&self, key: &CommitKey) -> Result<Option<CommitRecord>, LedgerError> {
        self.inner.record(key).await
    }
}

// ---------------------------------------------------------------------------
// Index fake
// ---------------------------------------------------------------------------

/// In-memory index keyed by document id.
#[derive(Default)]
pub struct FakeIndex {
    pub docs: Mutex<BTreeMap<Uuid, IndexedDocument>>,
    /// Job ids whose writes fail.
    pub failing: Mutex<HashSet<String>>,
    /// Documents submitted, including failures.
    pub writes: AtomicUsize,
}

impl FakeIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_job(&self, job_id: &str) {
        self.failing.lock().unwrap().insert(job_id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Indexer for FakeIndex {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), IndexError> {
        let outcome = self.upsert_batch(std::slice::from_ref(doc)).await;
        match outcome.items.into_iter().next().and_then(|i| i.error) {
            None => Ok(()),
            Some(body) => Err(IndexError::Status {
                status: 500,
                body,
                retry_after: None,
            }),
        }
    }

    async fn upsert_batch(&self, docs: &[IndexedDocument]) -> BatchOutcome {
        let failing = self.failing.lock().unwrap().clone();
        let mut stored = self.docs.lock().unwrap();
        let items = docs
            .iter()
            .map(|doc| {
                self.writes.fetch_add(1, Ordering::SeqCst);
                if failing.contains(&doc.job_id) {
                    return ItemResult {
                        id: doc.id,
                        error: Some("HTTP 500: injected".to_string()),
                    };
                }
                stored.insert(doc.id, doc.clone());
                ItemResult { id: doc.id, error: None }
            })
            .collect();
        BatchOutcome { items }
    }
}

#[async_trait::async_trait]
impl RunQuery for FakeIndex {
    async fn search_runs(&self, filter: &RunFilter) -> Result<Vec<IndexedDocument>, IndexError> {
        let mut hits: Vec<IndexedDocument> = self
            .docs
            .lock()
            .unwrap()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Mail fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeMailer {
    pub sent: Mutex<Vec<ReportMessage>>,
    pub fail: AtomicBool,
}

impl FakeMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<ReportMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::NoRecipients);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP fakes
// ---------------------------------------------------------------------------

pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A scripted reply: status, optional `Retry-After` seconds, JSON body.
#[derive(Clone)]
pub struct Scripted {
    pub status: StatusCode,
    pub retry_after: Option<u64>,
    pub body: Value,
}

impl Scripted {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            retry_after: None,
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            retry_after: None,
            body: json!({"error": "scripted"}),
        }
    }

    pub fn rate_limited(secs: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(secs),
            body: json!({"error": "slow down"}),
        }
    }
}

impl IntoResponse for Scripted {
    fn into_response(self) -> Response {
        let mut resp = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after {
            resp.headers_mut()
                .insert("retry-after", HeaderValue::from_str(&secs.to_string()).unwrap());
        }
        resp
    }
}

/// Registry that answers from a script, then with empty pages.
#[derive(Default)]
pub struct ScriptedRegistry {
    pub script: Mutex<VecDeque<Scripted>>,
    /// `path?query` of every GET.
    pub requests: Mutex<Vec<String>>,
}

impl ScriptedRegistry {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn registry_handler(State(state): State<Arc<ScriptedRegistry>>, method: Method, uri: Uri) -> Response {
    if method == Method::HEAD {
        return StatusCode::OK.into_response();
    }
    let target = uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_default();
    state.requests.lock().unwrap().push(target);
    let next = state.script.lock().unwrap().pop_front();
    next.unwrap_or_else(|| Scripted::ok(json!([]))).into_response()
}

pub async fn spawn_registry(registry: Arc<ScriptedRegistry>) -> String {
    let app = Router::new().fallback(registry_handler).with_state(registry);
    format!("http://{}", serve(app).await)
}

/// Just enough of the OpenSearch REST API for the client.
#[derive(Default)]
pub struct FakeSearch {
    pub index_exists: AtomicBool,
    pub docs: Mutex<BTreeMap<String, Value>>,
    /// Document ids whose bulk items fail.
    pub failing: Mutex<HashSet<String>>,
    pub reject_credentials: AtomicBool,
    /// `METHOD path` of every request.
    pub requests: Mutex<Vec<String>>,
    pub last_search: Mutex<Option<Value>>,
    pub last_auth: Mutex<Option<String>>,
}

impl FakeSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn search_handler(
    State(state): State<Arc<FakeSearch>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().unwrap().push(format!("{method} {}", uri.path()));
    *state.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if state.reject_credentials.load(Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let parts: Vec<&str> = uri.path().trim_matches('/').split('/').collect();
    match (method.as_str(), parts.as_slice()) {
        ("HEAD", [_index]) => {
            if state.index_exists.load(Ordering::SeqCst) {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        ("PUT", [_index]) => {
            state.index_exists.store(true, Ordering::SeqCst);
            Json(json!({"acknowledged": true})).into_response()
        }
        ("PUT", [_index, "_doc", id]) => {
            let doc: Value = serde_json::from_slice(&body).unwrap();
            let replaced = state.docs.lock().unwrap().insert(id.to_string(), doc).is_some();
            let (status, result) = if replaced {
                (StatusCode::OK, "updated")
            } else {
                (StatusCode::CREATED, "created")
            };
            (status, Json(json!({"_id": id, "result": result}))).into_response()
        }
        ("POST", ["_bulk"]) => {
            let text = String::from_utf8(body.to_vec()).unwrap();
            let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
            let failing = state.failing.lock().unwrap().clone();
            let mut items = Vec::new();
            let mut errors = false;
            for pair in lines.chunks(2) {
                let action: Value = serde_json::from_str(pair[0]).unwrap();
                let id = action["index"]["_id"].as_str().unwrap().to_string();
                if failing.contains(&id) {
                    errors = true;
                    items.push(json!({"index": {"_id": id, "status": 400,
                        "error": {"type": "mapper_parsing_exception", "reason": "failed to parse"}}}));
                    continue;
                }
                let doc: Value = serde_json::from_str(pair[1]).unwrap();
                state.docs.lock().unwrap().insert(id.clone(), doc);
                items.push(json!({"index": {"_id": id, "status": 201}}));
            }
            Json(json!({"errors": errors, "items": items})).into_response()
        }
        ("POST", [_index, "_search"]) => {
            if !state.index_exists.load(Ordering::SeqCst) {
                return (StatusCode::NOT_FOUND, Json(json!({"error": "index_not_found_exception"}))).into_response();
            }
            *state.last_search.lock().unwrap() = serde_json::from_slice(&body).ok();
            let hits: Vec<Value> = state
                .docs
                .lock()
                .unwrap()
                .iter()
                .map(|(id, doc)| json!({"_id": id, "_source": doc}))
                .collect();
            Json(json!({"hits": {"total": {"value": hits.len()}, "hits": hits}})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn spawn_search(search: Arc<FakeSearch>) -> String {
    let app = Router::new().fallback(search_handler).with_state(search);
    format!("http://{}", serve(app).await)
}
