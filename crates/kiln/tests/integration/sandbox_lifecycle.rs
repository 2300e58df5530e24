use std::collections::BTreeMap;

use kiln::BoxPool;
use kiln::sandbox::{Sandbox, SandboxBox, SandboxError, SandboxProcess, SpawnRequest};
use kiln::types::{ResourceLimits, SandboxStatus};

use super::test_config;

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_write_and_read_file() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(200, &artifacts);
    let pool = BoxPool::new(&config, config.cgroup);

    let mut workspace = pool.acquire().await.expect("Failed to acquire box");
    workspace
        .write_file("note.txt", b"Hello, World!")
        .await
        .expect("Failed to write file");

    let content = workspace
        .read_file("note.txt")
        .await
        .expect("Failed to read file");
    assert_eq!(content, b"Hello, World!");

    workspace.release().await.expect("Failed to release box");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_rejects_escaping_paths() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(204, &artifacts);
    let pool = BoxPool::new(&config, config.cgroup);

    let mut workspace = pool.acquire().await.unwrap();
    let result = workspace.write_file("../escape.txt", b"nope").await;
    assert!(matches!(result, Err(SandboxError::InvalidPath(_))));

    workspace.release().await.unwrap();
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_spawn_reads_stdin() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(208, &artifacts);
    let pool = BoxPool::new(&config, config.cgroup);

    let mut workspace = pool.acquire().await.unwrap();
    let env = BTreeMap::from([("PATH".to_owned(), "/usr/bin:/bin".to_owned())]);
    let mut process = workspace
        .spawn(SpawnRequest {
            command: vec!["/bin/cat".to_owned()],
            stdin: b"through the box\n".to_vec(),
            env,
            limits: ResourceLimits::execution_defaults(),
        })
        .await
        .expect("Failed to spawn");

    let report = process.wait().await.expect("Failed to wait");
    assert_eq!(report.status, SandboxStatus::Ok);
    assert_eq!(report.stdout.to_text(), "through the box\n");

    workspace.release().await.unwrap();
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_release_is_idempotent() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(212, &artifacts);
    let pool = BoxPool::new(&config, config.cgroup);

    let mut workspace = pool.acquire().await.unwrap();
    workspace.release().await.expect("first release");
    workspace.release().await.expect("second release");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_pool_reuses_released_boxes() {
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = test_config(216, &artifacts);
    config.sandbox.pool_size = 1;
    let pool = BoxPool::new(&config, config.cgroup);

    for _ in 0..3 {
        let mut workspace = pool.acquire().await.expect("Failed to acquire box");
        assert_eq!(workspace.id(), 216);
        workspace.release().await.unwrap();
    }
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_closed_pool_refuses() {
    let artifacts = tempfile::tempdir().unwrap();
    let config = test_config(220, &artifacts);
    let pool = BoxPool::new(&config, config.cgroup);
    pool.close();

    assert!(pool.acquire().await.is_err());
}
