use kiln::Compiler;
use kiln::Severity;
use tokio_util::sync::CancellationToken;

use super::{fixture_source, sandbox, test_config};

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_hello() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(300, &artifacts);
    let compiler = Compiler::new(sandbox(&config), &config);

    let mut result = compiler
        .compile(&fixture_source("hello.c"), &CancellationToken::new())
        .await
        .expect("Compilation errored");

    assert!(result.is_success(), "output: {}", result.raw_output);
    assert!(!result.timed_out);
    assert_eq!(result.errors().count(), 0);

    let artifact = result.take_artifact().expect("missing artifact");
    assert!(!artifact.is_empty());
    assert!(artifact.path().starts_with(artifacts.path()));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_error_diagnostics() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(304, &artifacts);
    let compiler = Compiler::new(sandbox(&config), &config);

    let result = compiler
        .compile(&fixture_source("compile_error.c"), &CancellationToken::new())
        .await
        .expect("Compilation errored");

    assert!(!result.is_success());
    assert!(result.artifact.is_none());

    let first = result.errors().next().expect("no error diagnostic");
    assert_eq!(first.severity, Severity::Error);
    assert!(first.line.is_some_and(|line| line >= 4), "unexpected {first}");
    assert!(result.raw_output.contains("error"));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_warning_still_succeeds() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(308, &artifacts);
    let compiler = Compiler::new(sandbox(&config), &config);

    let result = compiler
        .compile(&fixture_source("warning.c"), &CancellationToken::new())
        .await
        .expect("Compilation errored");

    assert!(result.is_success());
    assert!(result.warnings().any(|d| d.message.contains("unused")));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_warnings_as_errors() {
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = test_config(312, &artifacts);
    config.compiler.warnings_as_errors = true;
    let compiler = Compiler::new(sandbox(&config), &config);

    let result = compiler
        .compile(&fixture_source("warning.c"), &CancellationToken::new())
        .await
        .expect("Compilation errored");

    assert!(!result.is_success());
    assert!(result.artifact.is_none());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_artifact_removed_on_drop() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(316, &artifacts);
    let compiler = Compiler::new(sandbox(&config), &config);

    let mut result = compiler
        .compile(&fixture_source("hello.c"), &CancellationToken::new())
        .await
        .unwrap();
    let artifact = result.take_artifact().unwrap();
    let path = artifact.path().to_path_buf();
    assert!(path.exists());

    drop(artifact);
    assert!(!path.exists());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_output_is_reproducible() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(320, &artifacts);
    let compiler = Compiler::new(sandbox(&config), &config);
    let source = fixture_source("compile_error.c");

    let first = compiler
        .compile(&source, &CancellationToken::new())
        .await
        .expect("Compilation errored");
    let second = compiler
        .compile(&source, &CancellationToken::new())
        .await
        .expect("Compilation errored");

    assert!(!first.is_success());
    assert_eq!(first.raw_output, second.raw_output);
    assert_eq!(first.diagnostics, second.diagnostics);
}
