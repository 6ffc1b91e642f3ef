use std::time::Duration;

use queuectl::worker::Executor;

fn test_executor() -> Executor {
    Executor::default()
}

#[tokio::test]
async fn test_executes_a_simple_command() {
    let result = test_executor().execute("t1", "echo hello").await;

    assert_eq!(result.exit_code, 0);
    assert!(result.error.is_none());
    assert_eq!(result.stdout, "hello\n");
    assert!(result.stderr.is_empty());
    assert!(result.succeeded());
}

#[tokio::test]
async fn test_captures_output_without_trailing_newline() {
    let result = test_executor().execute("t2", "printf hello").await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello");
}

#[tokio::test]
async fn test_nonzero_exit_is_labeled() {
    let result = test_executor().execute("t3", "exit 3").await;

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.error.as_deref(), Some("nonzero_exit"));
    assert!(!result.succeeded());
}

#[tokio::test]
async fn test_stderr_is_captured_separately() {
    let result = test_executor()
        .execute("t4", "echo out; echo err >&2; exit 1")
        .await;

    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.error.as_deref(), Some("nonzero_exit"));
}

#[tokio::test]
async fn test_unknown_command_fails_through_the_shell() {
    // The shell itself reports the missing binary, so this is a nonzero
    // exit (127), not a spawn failure.
    let result = test_executor().execute("t5", "no_such_binary_12345").await;

    assert_eq!(result.exit_code, 127);
    assert_eq!(result.error.as_deref(), Some("nonzero_exit"));
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn test_pipelines_run_as_given() {
    let result = test_executor().execute("t6", "echo one two three | wc -w").await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "3");
}

#[tokio::test]
async fn test_timeout_kills_the_command() {
    let result = Executor::new(Duration::from_secs(1))
        .execute("t7", "sleep 30")
        .await;

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_output_before_a_timeout_is_kept() {
    let result = Executor::new(Duration::from_secs(1))
        .execute("t8", "printf started; sleep 30")
        .await;

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.error.as_deref(), Some("timeout"));
    assert_eq!(result.stdout, "started");
}

#[tokio::test]
async fn test_timeout_reaches_children_of_the_shell() {
    // The whole process group is killed: the backgrounded sleep must not
    // keep the pipe open past the kill.
    let start = std::time::Instant::now();
    let result = Executor::new(Duration::from_secs(1))
        .execute("t9", "sleep 30 & wait")
        .await;

    assert_eq!(result.error.as_deref(), Some("timeout"));
    assert!(start.elapsed() < Duration::from_secs(10));
}
