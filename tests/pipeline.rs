//! End-to-end ingestion passes against in-memory fakes and a real ledger.

mod common;

use chrono::NaiveDate;
use serde_json::json;
use tempfile::TempDir;

use teuthology_metrics::ledger::{CommitKey, CommitStatus};
use teuthology_metrics::pipeline::{IngestPipeline, PipelineError, Stage};
use teuthology_metrics::report::{self, ReportSpec};
use teuthology_metrics::source::Selector;
use teuthology_metrics::transform::Status;
use teuthology_metrics::Delivery;

use common::{CountingLedger, FakeIndex, FakeMailer, FakeSource};

fn smoke() -> Selector {
    Selector {
        user: Some("teuthology".into()),
        suite: Some("smoke".into()),
        ..Selector::default()
    }
}

fn may_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn main_on(day: NaiveDate) -> ReportSpec {
    ReportSpec {
        branch: "main".into(),
        start: day,
        end: day,
        commit_sha: None,
        recipients: vec!["qa@example.com".into()],
    }
}

#[tokio::test]
async fn test_ingest_then_report() {
    let dir = TempDir::new().unwrap();
    let index = FakeIndex::new();
    let mailer = FakeMailer::new();
    let services = common::services(
        FakeSource::new(common::nine_pass_one_fail("abc123")),
        index.clone(),
        common::ledger(dir.path()),
        mailer.clone(),
    );

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.stage, Stage::Committed);
    assert_eq!(outcome.fetched, 10);
    assert_eq!(outcome.indexed, 10);
    assert_eq!(outcome.committed, vec![CommitKey::new("abc123", "smoke")]);
    assert_eq!(index.len(), 10);

    let record = services
        .ledger
        .record(&CommitKey::new("abc123", "smoke"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CommitStatus::Done);

    let spec = ReportSpec {
        branch: "main".into(),
        start: may_first(),
        end: may_first(),
        commit_sha: None,
        recipients: vec!["qa@example.com".into()],
    };
    let result = report::build_report(services.query.as_ref(), &spec, common::RESULTS_SERVER, 10)
        .await
        .unwrap();
    assert_eq!(result.totals.total, 10);
    assert_eq!(result.totals.pass, 9);
    assert_eq!(result.totals.fail, 1);
    assert_eq!(result.by_suite["smoke"].total, 10);
    assert_eq!(result.notable_failures.len(), 1);
    assert_eq!(result.notable_failures[0].job_id, "run-10");
    assert_eq!(result.notable_failures[0].status, Status::Fail);
    assert_eq!(
        result.notable_failures[0].link,
        format!("{}/run-10", common::RESULTS_SERVER)
    );

    let delivery = services.deliver_report(&spec).await.unwrap();
    assert_eq!(
        delivery,
        Delivery::Sent {
            runs: 10,
            recipients: 1
        }
    );
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Teuthology Test Summary - 2024-05-01 - main");
    assert!(sent[0].html_body.contains("run-10"));
}

#[tokio::test]
async fn test_reingest_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(common::nine_pass_one_fail("abc123")),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );
    let key = CommitKey::new("abc123", "smoke");

    services.pipeline().run(&smoke()).await.unwrap();
    let writes = index.writes();
    let before = services.ledger.record(&key).await.unwrap().unwrap();

    let again = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(again.stage, Stage::Committed);
    assert_eq!(again.indexed, 0);
    assert_eq!(again.skipped, 10);
    assert!(again.committed.is_empty());
    assert_eq!(index.writes(), writes);

    let after = services.ledger.record(&key).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_runs_without_job_id_are_counted_not_fatal() {
    let dir = TempDir::new().unwrap();
    let mut runs = common::nine_pass_one_fail("abc123");
    let mut nameless = common::run_json("ignored", "smoke", "abc123", "pass");
    nameless.as_object_mut().unwrap().remove("name");
    runs.push(nameless);

    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(runs),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.fetched, 11);
    assert_eq!(outcome.data_errors, 1);
    assert_eq!(outcome.indexed, 10);
    assert_eq!(outcome.stage, Stage::Committed);
    assert_eq!(index.len(), 10);
}

#[tokio::test]
async fn test_partial_failure_is_retried_by_next_pass() {
    let dir = TempDir::new().unwrap();
    let index = FakeIndex::new();
    index.fail_job("run-03");
    let services = common::services(
        FakeSource::new(common::nine_pass_one_fail("abc123")),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );
    let key = CommitKey::new("abc123", "smoke");

    let first = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(first.stage, Stage::PartialFailure);
    assert!(!first.is_complete());
    assert_eq!(first.failed, 1);
    assert_eq!(first.indexed, 9);
    assert_eq!(first.failed_commits, vec![key.clone()]);
    assert!(!services.ledger.has_processed(&key).await.unwrap());
    assert_eq!(
        services.ledger.record(&key).await.unwrap().unwrap().status,
        CommitStatus::Failed
    );

    index.heal();
    let second = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(second.stage, Stage::Committed);
    assert_eq!(second.indexed, 10);
    assert_eq!(second.committed, vec![key.clone()]);
    assert!(services.ledger.has_processed(&key).await.unwrap());
    // rewritten documents replace the earlier copies
    assert_eq!(index.len(), 10);
}

#[tokio::test]
async fn test_fetch_failure_leaves_ledger_untouched() {
    let dir = TempDir::new().unwrap();
    let source = FakeSource::new(common::nine_pass_one_fail("abc123"));
    source.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let index = FakeIndex::new();
    let services = common::services(source, index.clone(), common::ledger(dir.path()), FakeMailer::new());

    let err = services.pipeline().run(&smoke()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Fetch(_)));
    assert_eq!(index.writes(), 0);
    assert!(services
        .ledger
        .record(&CommitKey::new("abc123", "smoke"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_commits_are_tracked_per_suite() {
    let dir = TempDir::new().unwrap();
    let mut runs = common::nine_pass_one_fail("abc123");
    runs.push(common::run_json("fs-01", "fs", "abc123", "pass"));
    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(runs),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );

    services.pipeline().run(&smoke()).await.unwrap();
    assert!(!services.ledger.has_processed(&CommitKey::new("abc123", "fs")).await.unwrap());

    let fs = Selector {
        suite: Some("fs".into()),
        ..Selector::default()
    };
    let outcome = services.pipeline().run(&fs).await.unwrap();
    assert_eq!(outcome.indexed, 1);
    assert_eq!(outcome.committed, vec![CommitKey::new("abc123", "fs")]);
}

#[tokio::test]
async fn test_runs_without_commit_are_indexed_only() {
    let dir = TempDir::new().unwrap();
    let mut run = common::run_json("nosha-1", "smoke", "unused", "pass");
    run["sha1"] = json!(null);
    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(vec![run]),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.indexed, 1);
    assert!(outcome.committed.is_empty());
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn test_empty_report_is_still_sent_by_default() {
    let dir = TempDir::new().unwrap();
    let mailer = FakeMailer::new();
    let mut services = common::services(
        FakeSource::new(vec![]),
        FakeIndex::new(),
        common::ledger(dir.path()),
        mailer.clone(),
    );
    let spec = ReportSpec {
        branch: "squid".into(),
        start: may_first(),
        end: may_first(),
        commit_sha: None,
        recipients: vec!["qa@example.com".into()],
    };

    let delivery = services.deliver_report(&spec).await.unwrap();
    assert_eq!(delivery, Delivery::Sent { runs: 0, recipients: 1 });
    assert!(mailer.sent()[0].html_body.contains("No runs found"));

    services.report.skip_empty = true;
    assert_eq!(services.deliver_report(&spec).await.unwrap(), Delivery::SkippedEmpty);
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_one_run_with_ten_tasks() {
    let dir = TempDir::new().unwrap();
    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(vec![common::one_run_ten_tasks("abc123")]),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );
    let key = CommitKey::new("abc123", "smoke");

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.stage, Stage::Committed);
    assert_eq!(outcome.fetched, 1);
    assert_eq!(outcome.indexed, 1);
    assert_eq!(outcome.committed, vec![key.clone()]);

    let docs: Vec<_> = index.docs.lock().unwrap().values().cloned().collect();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, Status::Fail);
    assert_eq!(docs[0].tasks.len(), 10);
    assert_eq!(docs[0].task_counts.pass, 9);
    assert_eq!(docs[0].task_counts.fail, 1);
    assert!(services.ledger.has_processed(&key).await.unwrap());

    let result = report::build_report(services.query.as_ref(), &main_on(may_first()), common::RESULTS_SERVER, 10)
        .await
        .unwrap();
    let smoke = result.by_suite["smoke"];
    assert_eq!((smoke.total, smoke.pass, smoke.fail), (1, 0, 1));
    assert_eq!(result.notable_failures[0].job_id, "run-01");
    assert_eq!(result.notable_failures[0].failing_tasks, 1);
}

#[tokio::test]
async fn test_unfinished_run_keeps_commit_pending() {
    let dir = TempDir::new().unwrap();
    let mut running = common::run_json("run-01", "smoke", "abc123", "running");
    running["jobs"][1]["status"] = json!("running");
    let source = FakeSource::new(vec![running]);
    let index = FakeIndex::new();
    let services = common::services(source.clone(), index.clone(), common::ledger(dir.path()), FakeMailer::new());
    let key = CommitKey::new("abc123", "smoke");

    let first = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(first.stage, Stage::Committed);
    assert_eq!(first.indexed, 1);
    assert!(first.committed.is_empty());
    assert_eq!(first.unsettled, vec![key.clone()]);
    assert!(!services.ledger.has_processed(&key).await.unwrap());
    assert_eq!(
        services.ledger.record(&key).await.unwrap().unwrap().status,
        CommitStatus::Pending
    );
    let stored = index.docs.lock().unwrap().values().next().cloned().unwrap();
    assert_eq!(stored.status, Status::Unknown);
    assert!(stored.in_flight);

    // the run finishes; the next pass picks the commit up again
    source.set_runs(vec![common::run_json("run-01", "smoke", "abc123", "finished fail")]);
    let second = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(second.indexed, 1);
    assert_eq!(second.committed, vec![key.clone()]);
    assert!(second.unsettled.is_empty());
    assert!(services.ledger.has_processed(&key).await.unwrap());

    assert_eq!(index.len(), 1);
    let stored = index.docs.lock().unwrap().values().next().cloned().unwrap();
    assert_eq!(stored.status, Status::Fail);
    assert!(!stored.in_flight);

    let third = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(third.skipped, 1);
    assert_eq!(third.indexed, 0);
}

#[tokio::test]
async fn test_concurrent_passes_mark_commit_done_once() {
    let dir = TempDir::new().unwrap();
    let source = FakeSource::new(common::nine_pass_one_fail("abc123"));
    let index = FakeIndex::new();
    let ledger = CountingLedger::new(common::ledger(dir.path()));
    let pipeline = || IngestPipeline::new(source.clone(), index.clone(), ledger.clone(), "teuthology", 4);
    let (a, b) = (pipeline(), pipeline());

    let (sel_a, sel_b) = (smoke(), smoke());
    let (first, second) = tokio::join!(a.run(&sel_a), b.run(&sel_b));
    let (first, second) = (first.unwrap(), second.unwrap());

    let key = CommitKey::new("abc123", "smoke");
    assert_eq!(ledger.done_count(&key), 1);
    assert_eq!(first.committed.len() + second.committed.len(), 1);
    assert_eq!(first.indexed + second.indexed, 10);
    assert_eq!(first.skipped + second.skipped, 10);
    assert_eq!(index.len(), 10);
}

#[tokio::test]
async fn test_failure_reasons_are_templated() {
    let dir = TempDir::new().unwrap();
    let ledger = common::ledger(dir.path());
    let templates = common::templates(&ledger).await;
    let index = FakeIndex::new();
    let source = FakeSource::new(vec![common::one_run_ten_tasks("abc123")]);
    let mut other = common::one_run_ten_tasks("def456");
    other["name"] = json!("run-02");
    other["jobs"][9]["failure_reason"] = json!("Command failed on smithi117 with status 1: 'sudo ceph health'");
    source.push(other);

    let mut services = common::services(source, index.clone(), ledger, FakeMailer::new());
    services.templates = Some(templates.clone());

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.templated, 2);
    assert_eq!(outcome.indexed, 2);

    let docs: Vec<_> = index.docs.lock().unwrap().values().cloned().collect();
    let mined: Vec<_> = docs
        .iter()
        .map(|d| d.tasks[9].failure_template.clone().unwrap())
        .collect();
    assert_eq!(mined[0], mined[1]);
    assert_eq!(mined[0].template, "Command failed on <SMITHI*> with status 1: 'sudo ceph health'");
    assert!(docs.iter().all(|d| d.tasks[..9].iter().all(|t| t.failure_template.is_none())));
    assert_eq!(templates.templates().await.len(), 1);

    let result = report::build_report(services.query.as_ref(), &main_on(may_first()), common::RESULTS_SERVER, 10)
        .await
        .unwrap();
    assert!(result
        .notable_failures
        .iter()
        .all(|f| f.reason.as_deref() == Some("Command failed on <SMITHI*> with status 1: 'sudo ceph health'")));
}

#[tokio::test]
async fn test_template_mining_can_be_skipped() {
    let dir = TempDir::new().unwrap();
    let index = FakeIndex::new();
    let services = common::services(
        FakeSource::new(vec![common::one_run_ten_tasks("abc123")]),
        index.clone(),
        common::ledger(dir.path()),
        FakeMailer::new(),
    );
    assert!(services.templates.is_none());

    let outcome = services.pipeline().run(&smoke()).await.unwrap();
    assert_eq!(outcome.templated, 0);
    let doc = index.docs.lock().unwrap().values().next().cloned().unwrap();
    assert!(doc.tasks[9].failure_template.is_none());
    assert_eq!(
        doc.tasks[9].failure_reason.as_deref(),
        Some("Command failed on smithi042 with status 1: 'sudo ceph health'")
    );

    // the raw reason still reaches the report
    let result = report::build_report(services.query.as_ref(), &main_on(may_first()), common::RESULTS_SERVER, 10)
        .await
        .unwrap();
    assert_eq!(
        result.notable_failures[0].reason.as_deref(),
        Some("Command failed on smithi042 with status 1: 'sudo ceph health'")
    );
}
