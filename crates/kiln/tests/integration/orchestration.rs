use std::sync::Arc;

use kiln::{Action, JobOutcome, Orchestrator, Submission};
use tokio_util::sync::CancellationToken;

use super::{fixture_source, sandbox, test_config};

fn orchestrator(first_box_id: u32, artifacts: &tempfile::TempDir) -> Arc<Orchestrator> {
    let config = test_config(first_box_id, artifacts);
    Arc::new(Orchestrator::new(&config, sandbox(&config)).expect("invalid config"))
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_run_end_to_end() {
    let artifacts = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(500, &artifacts);

    let submission = Submission::new(Action::Run, fixture_source("sum.c")).with_stdin("10\n20\n");
    let result = orchestrator
        .submit("127.0.0.1".to_owned(), submission, CancellationToken::new())
        .await;
    let rendered = orchestrator.renderer().result(&result);

    assert_eq!(rendered.status, "completed");
    assert_eq!(rendered.body, "30\n");
    assert!(!rendered.signals_failure());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_only_leaves_no_artifact() {
    let artifacts = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(504, &artifacts);

    let report = orchestrator
        .handle(
            "127.0.0.1",
            Submission::new(Action::Compile, fixture_source("hello.c")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(report.outcome, JobOutcome::Compiled(_)));
    let leftovers = std::fs::read_dir(artifacts.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_failure_is_reported() {
    let artifacts = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(508, &artifacts);

    let result = orchestrator
        .submit(
            "127.0.0.1".to_owned(),
            Submission::new(Action::Run, fixture_source("compile_error.c")),
            CancellationToken::new(),
        )
        .await;
    let rendered = orchestrator.renderer().result(&result);

    assert_eq!(rendered.status, "compile_failed");
    assert!(rendered.body.starts_with("Compilation failed:\n"));
    assert!(rendered.signals_failure());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_infinite_loop_times_out() {
    let artifacts = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(512, &artifacts);

    let result = orchestrator
        .submit(
            "127.0.0.1".to_owned(),
            Submission::new(Action::Run, fixture_source("infinite_loop.c")),
            CancellationToken::new(),
        )
        .await;
    let rendered = orchestrator.renderer().result(&result);

    assert_eq!(rendered.status, "timed_out");
    assert!(rendered.body.contains("Error: Program execution timed out"));
}

#[tokio::test]
async fn test_dangerous_source_never_reaches_isolate() {
    let artifacts = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(516, &artifacts);

    let source = "#include <stdlib.h>\nint main(void) { return system(\"ls\"); }\n";
    let report = orchestrator
        .handle(
            "127.0.0.1",
            Submission::new(Action::Run, source),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(report.outcome, JobOutcome::Rejected(_)));
}
