use chrono::{Duration, Utc};
use tempfile::TempDir;

use queuectl::job::{JobSpec, JobState};
use queuectl::store::Store;

fn spec(id: &str, command: &str) -> JobSpec {
    JobSpec {
        id: Some(id.to_string()),
        command: command.to_string(),
        max_retries: None,
        priority: None,
        run_at: None,
    }
}

#[test]
fn test_jobs_survive_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("queuectl.db");
    let now = Utc::now();

    // First process: one pending job, one driven to the DLQ.
    {
        let mut store = Store::open(&db).unwrap();
        store.init().unwrap();
        store.enqueue(&spec("keeps-waiting", "true"), now).unwrap();

        let mut doomed = spec("already-dead", "false");
        doomed.max_retries = Some(1);
        store.enqueue(&doomed, now - Duration::seconds(10)).unwrap();
        let claimed = store.claim("w", now - Duration::seconds(10)).unwrap().unwrap();
        assert_eq!(claimed.id, "already-dead");
        store
            .fail(
                "already-dead",
                1,
                "nonzero_exit",
                "",
                "",
                now - Duration::seconds(9),
                2,
                None,
            )
            .unwrap();
    }

    // Second process: nothing was lost and nothing changed state.
    let mut store = Store::open(&db).unwrap();
    let counts = store.counts_by_state().unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.dead, 1);

    let waiting = store.get("keeps-waiting").unwrap().unwrap();
    assert_eq!(waiting.state, JobState::Pending);

    let dead = store.get("already-dead").unwrap().unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 1);

    // The pending job is still claimable after the restart.
    let claimed = store.claim("w2", now + Duration::seconds(1)).unwrap().unwrap();
    assert_eq!(claimed.id, "keeps-waiting");
}

#[test]
fn test_config_survives_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("queuectl.db");

    {
        let store = Store::open(&db).unwrap();
        store.init().unwrap();
        store.config_set("backoff-base", "7").unwrap();
    }

    let store = Store::open(&db).unwrap();
    assert_eq!(
        store.config_get("backoff_base").unwrap().as_deref(),
        Some("7")
    );
}

#[test]
fn test_retry_schedule_survives_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("queuectl.db");
    let now = Utc::now();

    {
        let mut store = Store::open(&db).unwrap();
        store.init().unwrap();
        let mut flaky = spec("flaky", "false");
        flaky.max_retries = Some(3);
        store.enqueue(&flaky, now).unwrap();
        store.claim("w", now).unwrap().unwrap();
        store
            .fail("flaky", 1, "nonzero_exit", "", "", now, 2, None)
            .unwrap();
    }

    let mut store = Store::open(&db).unwrap();
    let job = store.get("flaky").unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);

    // Not eligible before its backoff delay elapses, eligible after.
    assert!(store.claim("w", now).unwrap().is_none());
    assert!(store
        .claim("w", now + Duration::seconds(10))
        .unwrap()
        .is_some());
}
