use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use queuectl::job::{JobSpec, JobState};
use queuectl::store::Store;
use queuectl::worker::Worker;

fn init_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("queuectl.db");
    let store = Store::open(&path).expect("open store");
    store.init().expect("init schema");
    path
}

fn spec(id: &str, command: &str) -> JobSpec {
    JobSpec {
        id: Some(id.to_string()),
        command: command.to_string(),
        max_retries: None,
        priority: None,
        run_at: None,
    }
}

fn spawn_workers(db: &Path, count: u32, token: &CancellationToken) {
    for i in 0..count {
        let store = Store::open(db).expect("open worker store");
        let worker = Worker::new(format!("test-worker-{}", i + 1), store, token.clone());
        tokio::spawn(worker.run());
    }
}

/// Poll until `cond` holds or `secs` elapse. Returns whether it held.
async fn wait_until(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_worker_completes_an_enqueued_job() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let store = Store::open(&db).unwrap();
    store.enqueue(&spec("a", "printf hello"), Utc::now()).unwrap();

    let token = CancellationToken::new();
    spawn_workers(&db, 1, &token);

    let done = wait_until(15, || {
        store.get("a").unwrap().unwrap().state == JobState::Completed
    })
    .await;
    token.cancel();
    assert!(done, "job never completed");

    let job = store.get("a").unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.stdout.as_deref(), Some("hello"));
    assert!(job.claimed_by.is_none());
}

#[tokio::test]
async fn test_failing_job_retries_to_the_dead_letter_queue() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let store = Store::open(&db).unwrap();
    store.config_set("backoff_base", "1").unwrap();
    let mut failing = spec("b", "exit 1");
    failing.max_retries = Some(2);
    store.enqueue(&failing, Utc::now()).unwrap();

    let token = CancellationToken::new();
    spawn_workers(&db, 1, &token);

    let done = wait_until(30, || {
        store.get("b").unwrap().unwrap().state == JobState::Dead
    })
    .await;
    token.cancel();
    assert!(done, "job never reached the dead-letter queue");

    let job = store.get("b").unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.exit_code, Some(1));
    assert_eq!(job.error.as_deref(), Some("nonzero_exit"));
}

#[tokio::test]
async fn test_single_worker_runs_jobs_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let store = Store::open(&db).unwrap();
    let now = Utc::now();

    // All enqueued before the worker starts, so only priority decides.
    let mut low = spec("low", "true");
    low.priority = Some(1);
    let mut high = spec("high", "true");
    high.priority = Some(10);
    let mut mid = spec("mid", "true");
    mid.priority = Some(5);
    store.enqueue(&low, now).unwrap();
    store.enqueue(&high, now).unwrap();
    store.enqueue(&mid, now).unwrap();

    let token = CancellationToken::new();
    spawn_workers(&db, 1, &token);

    let done = wait_until(20, || {
        ["low", "mid", "high"]
            .iter()
            .all(|id| store.get(id).unwrap().unwrap().state == JobState::Completed)
    })
    .await;
    token.cancel();
    assert!(done, "jobs never drained");

    let finished_at =
        |id: &str| store.get(id).unwrap().unwrap().updated_at;
    assert!(finished_at("high") < finished_at("mid"));
    assert!(finished_at("mid") < finished_at("low"));
}

#[tokio::test]
async fn test_scheduled_job_is_not_run_early() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let store = Store::open(&db).unwrap();
    let now = Utc::now();

    let mut scheduled = spec("later", "true");
    scheduled.run_at = Some(now + chrono::Duration::seconds(3));
    store.enqueue(&scheduled, now).unwrap();

    let token = CancellationToken::new();
    spawn_workers(&db, 1, &token);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        store.get("later").unwrap().unwrap().state,
        JobState::Pending,
        "scheduled job ran before its run_at"
    );

    let done = wait_until(15, || {
        store.get("later").unwrap().unwrap().state == JobState::Completed
    })
    .await;
    token.cancel();
    assert!(done, "scheduled job never ran");
}

#[tokio::test]
async fn test_concurrent_workers_claim_each_job_exactly_once() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let store = Store::open(&db).unwrap();
    let now = Utc::now();

    let ids: Vec<String> = (0..10).map(|i| format!("job-{i:02}")).collect();
    for id in &ids {
        store.enqueue(&spec(id, "true"), now).unwrap();
    }

    let token = CancellationToken::new();
    spawn_workers(&db, 5, &token);

    let done = wait_until(30, || {
        store.counts_by_state().unwrap().completed == 10
    })
    .await;
    token.cancel();
    assert!(done, "queue never drained");

    // At-most-once claiming means exactly one attempt per job.
    for id in &ids {
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed, "{id}");
        assert_eq!(job.attempts, 1, "{id} was claimed more than once");
        assert!(job.claimed_by.is_none());
    }
}

#[tokio::test]
async fn test_dead_job_retried_from_the_dlq_can_succeed() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let mut store = Store::open(&db).unwrap();
    let flag = dir.path().join("flag");

    // Fails until the flag file exists, then prints ok.
    let command = format!("test -e {} && printf ok", flag.display());
    let mut job = spec("c", &command);
    job.max_retries = Some(1);
    store.enqueue(&job, Utc::now()).unwrap();

    let token = CancellationToken::new();
    spawn_workers(&db, 1, &token);

    let dead = wait_until(15, || {
        store.get("c").unwrap().unwrap().state == JobState::Dead
    })
    .await;
    assert!(dead, "job never died");

    std::fs::write(&flag, b"").unwrap();
    store.dlq_retry("c", None, Utc::now()).unwrap();

    let done = wait_until(15, || {
        store.get("c").unwrap().unwrap().state == JobState::Completed
    })
    .await;
    token.cancel();
    assert!(done, "retried job never completed");

    let job = store.get("c").unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.stdout.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_workers_stop_on_cancellation() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);

    let token = CancellationToken::new();
    let store = Store::open(&db).unwrap();
    let worker = Worker::new("stopper", store, token.clone());
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop after cancellation")
        .unwrap();
}
