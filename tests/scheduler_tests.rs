//! Worker scheduler tests: polling, claiming, concurrency caps, manual runs.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskfabric::config::LauncherConfig;
use taskfabric::storage::{JobResult, JobStatus, MemoryStore};
use taskfabric::worker::{JobRunner, WorkerScheduler};
use test_harness::{assert_eventually, wait_for};

fn scheduler_with(
    store: Arc<MemoryStore>,
    targets: &[(&str, u32)],
    template: &str,
    fetch_limit: u32,
) -> Arc<WorkerScheduler> {
    let launcher = LauncherConfig {
        template: template.to_string(),
        cwd: None,
        env: HashMap::new(),
    };
    let runner = JobRunner::new(store.clone(), launcher, 1024 * 1024);
    let targets: HashMap<String, u32> = targets
        .iter()
        .map(|(name, concurrency)| (name.to_string(), *concurrency))
        .collect();
    WorkerScheduler::new(store, runner, &targets, fetch_limit).unwrap()
}

#[tokio::test]
async fn single_job_happy_path() {
    let store = Arc::new(MemoryStore::new());
    store.insert_waiting(1, "t").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/true", 100);
    scheduler
        .poll_targets(Some(vec!["t".to_string()]))
        .await
        .unwrap();

    assert_eventually(
        || async { store.row(1).await.unwrap().status == JobStatus::Done },
        Duration::from_secs(5),
        "job should reach done",
    )
    .await;

    let row = store.row(1).await.unwrap();
    assert_eq!(row.result, Some(JobResult::Ok));
    assert_eq!(row.return_code, Some(0));
    let started = row.time_started.unwrap();
    assert!(started > 0);
    assert!(row.time_finished.unwrap() >= started);
}

#[tokio::test]
async fn running_jobs_never_exceed_the_concurrency_cap() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=10 {
        store.insert_waiting(id, "t").await;
    }

    let scheduler = scheduler_with(store.clone(), &[("t", 3)], "/bin/sleep 0.2", 100);
    scheduler.clone().poll_targets(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let running = store.count_in_status("t", JobStatus::Running).await;
        assert!(running <= 3, "cap violated: {running} running");
        if store.count_in_status("t", JobStatus::Done).await == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn poll_for_unserved_target_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    store.insert_waiting(1, "missing").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/true", 100);
    let error = scheduler
        .poll_targets(Some(vec!["missing".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(error.to_string(), "invalid target 'missing'");

    // The row was never touched.
    assert_eq!(store.row(1).await.unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn full_fetch_schedules_a_follow_up_poll() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=5 {
        store.insert_waiting(id, "t").await;
    }

    let scheduler = scheduler_with(store.clone(), &[("t", 2)], "/bin/true", 2);
    scheduler
        .poll_targets(Some(vec!["t".to_string()]))
        .await
        .unwrap();

    assert_eventually(
        || async { store.count_in_status("t", JobStatus::Done).await == 5 },
        Duration::from_secs(5),
        "follow-up polls should drain the backlog past the fetch limit",
    )
    .await;
}

#[tokio::test]
async fn paused_target_claims_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.insert_waiting(1, "t").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/true", 100);
    scheduler.pause(Some(vec!["t".to_string()])).await.unwrap();
    scheduler
        .clone()
        .poll_targets(Some(vec!["t".to_string()]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.row(1).await.unwrap().status, JobStatus::Waiting);

    // Resuming alone does not poll; the retained backlog is drained by the
    // next poke.
    scheduler
        .clone()
        .resume(Some(vec!["t".to_string()]))
        .await
        .unwrap();
    scheduler
        .poll_targets(Some(vec!["t".to_string()]))
        .await
        .unwrap();
    assert_eventually(
        || async { store.row(1).await.unwrap().status == JobStatus::Done },
        Duration::from_secs(5),
        "job should run after resume",
    )
    .await;
}

#[tokio::test]
async fn manual_run_returns_the_outcome_synchronously() {
    let store = Arc::new(MemoryStore::new());
    store.insert_manual(7, "t").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/echo hello {id}", 100);
    let report = scheduler.clone().run_manual(vec![7]).await.unwrap();

    assert!(report.errors.is_empty());
    let outcome = &report.jobs[&7];
    assert_eq!(outcome.result, JobResult::Ok);
    assert_eq!(outcome.stdout, "hello 7\n");
    assert_eq!(store.row(7).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn manual_run_classifies_bad_rows() {
    let store = Arc::new(MemoryStore::new());
    // Wrong status: a waiting row is not claimable as manual.
    store.insert_waiting(1, "t").await;
    // Unserved target.
    store.insert_manual(2, "other").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/true", 100);
    let report = scheduler.clone().run_manual(vec![1, 2, 99]).await.unwrap();

    assert!(report.jobs.is_empty());
    assert_eq!(report.errors[&1], "status=waiting != manual");
    assert_eq!(report.errors[&2], "unknown target 'other'");
    assert_eq!(report.errors[&99], "job 99 not found");

    assert_eq!(store.row(1).await.unwrap().status, JobStatus::Ignored);
    assert_eq!(store.row(2).await.unwrap().status, JobStatus::Ignored);
}

#[tokio::test]
async fn duplicate_manual_ids_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    store.insert_manual(4, "t").await;

    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/sleep 0.2", 100);

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.clone().run_manual(vec![4]).await.unwrap() })
    };
    // Let the first batch claim the row and park its waiter, then ask for
    // the same id again.
    assert!(
        wait_for(
            || async { scheduler.status().await["jobPromisesCount"] == 1 },
            Duration::from_secs(2),
        )
        .await
    );
    let second = scheduler.clone().run_manual(vec![4]).await.unwrap();
    assert_eq!(second.errors[&4], "job 4 is already being executed");

    let first = first.await.unwrap();
    assert_eq!(first.jobs[&4].result, JobResult::Ok);
}

#[tokio::test]
async fn target_admin_operations() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_with(store.clone(), &[("t", 1)], "/bin/true", 100);

    scheduler.add_target("u", 2).await.unwrap();
    assert!(scheduler.add_target("u", 2).await.is_err());
    assert!(scheduler.add_target("null", 1).await.is_err());

    scheduler.clone().set_target_concurrency("u", 5).await.unwrap();
    assert!(scheduler.clone().set_target_concurrency("ghost", 1).await.is_err());

    scheduler.remove_target("u").await.unwrap();
    assert!(scheduler.remove_target("u").await.is_err());

    let served = scheduler.served_targets().await;
    assert_eq!(served, vec!["t".to_string()]);
}

#[tokio::test]
async fn status_reports_queue_shape() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_with(store.clone(), &[("t", 2)], "/bin/true", 100);
    scheduler.pause(None).await.unwrap();

    let status = scheduler.status().await;
    assert_eq!(status["targets"]["t"]["concurrency"], 2);
    assert_eq!(status["targets"]["t"]["paused"], true);
    assert_eq!(status["targets"]["t"]["length"], 0);
    assert_eq!(status["jobPromisesCount"], 0);
}
