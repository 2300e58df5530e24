use kiln::isolate::MetaFile;
use kiln::types::{CapturedOutput, LimitExceeded, SandboxStatus};

use super::FIXTURES_PATH;

fn meta_fixture_path(name: &str) -> String {
    format!("{FIXTURES_PATH}/meta/{name}")
}

fn load_meta_fixture(name: &str) -> MetaFile {
    let path = meta_fixture_path(name);
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read meta fixture {path}: {e}"));
    MetaFile::parse(&content)
}

#[test]
fn test_meta_success() {
    let meta = load_meta_fixture("success.meta");
    assert_eq!(meta.status(), SandboxStatus::Ok);
    assert_eq!(meta.exit_code(), Some(0));
    assert!((meta.cpu_time().as_secs_f64() - 0.042).abs() < 1e-6);
    assert_eq!(meta.memory_bytes(), 1432 * 1024);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::NotExceeded);
}

#[test]
fn test_meta_timeout() {
    let meta = load_meta_fixture("timeout.meta");
    assert_eq!(meta.status(), SandboxStatus::TimeLimitExceeded);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::Time);
    assert!(meta.killed());
}

#[test]
fn test_meta_wall_timeout() {
    let meta = load_meta_fixture("wall_timeout.meta");
    assert_eq!(meta.status(), SandboxStatus::TimeLimitExceeded);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::WallTime);
    assert!((meta.wall_time().as_secs_f64() - 5.002).abs() < 1e-6);
}

#[test]
fn test_meta_oom() {
    let meta = load_meta_fixture("oom.meta");
    assert_eq!(meta.status(), SandboxStatus::Signaled);
    assert!(meta.oom_killed());
    assert_eq!(meta.limit_exceeded(), LimitExceeded::Memory);
    assert_eq!(meta.signal(), Some(9));
    // cg-mem wins over max-rss
    assert_eq!(meta.memory_bytes(), 262_144 * 1024);
}

#[test]
fn test_meta_segfault() {
    let meta = load_meta_fixture("segfault.meta");
    assert_eq!(meta.status(), SandboxStatus::Signaled);
    assert_eq!(meta.signal(), Some(11));
    assert_eq!(meta.limit_exceeded(), LimitExceeded::NotExceeded);
}

#[test]
fn test_meta_nonzero_exit() {
    let meta = load_meta_fixture("nonzero.meta");
    let report = meta.to_report(CapturedOutput::default(), CapturedOutput::default());
    assert_eq!(report.status, SandboxStatus::RuntimeError);
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(report.message.as_deref(), Some("Exited with error status 3"));
}

#[test]
fn test_meta_internal_error() {
    let meta = load_meta_fixture("internal_error.meta");
    assert_eq!(meta.status(), SandboxStatus::InternalError);
    assert!(meta.message().unwrap().contains("clone failed"));
}

#[test]
fn test_meta_malformed_line() {
    let content = std::fs::read_to_string(meta_fixture_path("malformed.meta")).unwrap();

    // Lenient parse keeps the good lines
    let meta = MetaFile::parse(&content);
    assert_eq!(meta.exit_code(), Some(0));

    let err = MetaFile::try_parse(&content).unwrap_err();
    assert_eq!(err.line_number, 2);
}

#[tokio::test]
async fn test_meta_load_rejects_malformed() {
    assert!(MetaFile::load(meta_fixture_path("malformed.meta")).await.is_err());
    assert!(MetaFile::load(meta_fixture_path("success.meta")).await.is_ok());
}
