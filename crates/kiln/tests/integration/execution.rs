use kiln::types::{ExecutionState, ExitStatus};
use kiln::{Artifact, Compiler, Config, Executor};
use tokio_util::sync::CancellationToken;

use super::{fixture_source, sandbox, test_config};

async fn build(config: &Config, fixture: &str) -> (Executor, Artifact) {
    let sandbox = sandbox(config);
    let compiler = Compiler::new(std::sync::Arc::clone(&sandbox), config);
    let mut compiled = compiler
        .compile(&fixture_source(fixture), &CancellationToken::new())
        .await
        .expect("Compilation errored");
    assert!(compiled.is_success(), "output: {}", compiled.raw_output);

    let artifact = compiled.take_artifact().expect("missing artifact");
    (Executor::new(sandbox, config), artifact)
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_run_hello_world() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(400, &artifacts);
    let (executor, artifact) = build(&config, "hello.c").await;

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .expect("Execution errored");

    assert!(result.is_success());
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.stdout.to_text(), "Hello, World!\n");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_run_with_stdin() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(404, &artifacts);
    let (executor, artifact) = build(&config, "sum.c").await;

    let result = executor
        .execute(artifact, b"10\n20\n", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.stdout.to_text(), "30\n");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_empty_stdin_reaches_eof() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(408, &artifacts);
    let (executor, artifact) = build(&config, "read_all.c").await;

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.stdout.to_text(), "0\n");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_scanf_on_empty_stdin_completes() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(440, &artifacts);
    let (executor, artifact) = build(&config, "sum.c").await;

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Normal(1));
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.stderr.to_text(), "expected two integers\n");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_nonzero_exit() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(412, &artifacts);
    let (executor, artifact) = build(&config, "exit_code.c").await;

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Normal(3));
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.stderr.to_text(), "bad input\n");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_cpu_time_limit() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(416, &artifacts);
    let (executor, artifact) = build(&config, "infinite_loop.c").await;
    let limits = executor.limits().clone().with_cpu_time_ms(500);

    let result = executor
        .execute(artifact, b"", &limits, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::TimedOut);
    assert_eq!(result.state, ExecutionState::TimedOut);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_wall_time_limit() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(420, &artifacts);
    let (executor, artifact) = build(&config, "sleep.c").await;
    let limits = executor.limits().clone().with_wall_time_ms(1_000);

    let result = executor
        .execute(artifact, b"", &limits, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::TimedOut);
    assert!(result.duration.as_millis() < 5_000);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_memory_limit() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(424, &artifacts);
    let (executor, artifact) = build(&config, "memhog.c").await;
    let limits = executor.limits().clone().with_memory_bytes(64 * 1024 * 1024);

    let result = executor
        .execute(artifact, b"", &limits, &CancellationToken::new())
        .await
        .unwrap();

    // With cgroups the OOM killer fires; without them malloc fails near the
    // address space cap and the program exits 1. Both count as memory.
    assert_eq!(
        result.exit_status,
        ExitStatus::MemoryExceeded,
        "cgroup: {}, peak: {} bytes",
        config.cgroup,
        result.memory_bytes
    );
    assert_eq!(result.state, ExecutionState::MemoryExceeded);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_segfault_is_signaled() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(428, &artifacts);
    let (executor, artifact) = build(&config, "segfault.c").await;

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Signaled(11));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_output_is_capped() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(432, &artifacts);
    let (executor, artifact) = build(&config, "spam.c").await;
    let cap = executor.limits().max_output_bytes.unwrap();

    let result = executor
        .execute(artifact, b"", executor.limits(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.is_success());
    assert!(result.output_truncated());
    assert!(result.stdout.bytes.len() as u64 <= cap);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_cancel_kills_program() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(436, &artifacts);
    let (executor, artifact) = build(&config, "sleep.c").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = executor
        .execute(artifact, b"", executor.limits(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Killed);
    assert_eq!(result.state, ExecutionState::Killed);
}
