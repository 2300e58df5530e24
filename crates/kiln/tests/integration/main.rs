//! Integration tests for kiln
//!
//! These tests require the isolate binary and gcc to be installed.
//! Run with: cargo test -p kiln --features integration-tests
//!
//! Tests that require root are marked `#[ignore]`. To include them:
//!    cargo test -p kiln --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;
use std::sync::Arc;

use kiln::config::Config;
use kiln::{BoxPool, Sandbox};
use tempfile::TempDir;

mod compilation;
mod config_loading;
mod execution;
mod meta_file_fixtures;
mod orchestration;
mod sandbox_lifecycle;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// A config whose boxes start at `first_box_id`, so tests running in
/// parallel never share a box. Uses cgroups when available.
pub(crate) fn test_config(first_box_id: u32, artifacts: &TempDir) -> Config {
    let mut config = Config::default();
    config.sandbox.first_box_id = first_box_id;
    config.sandbox.pool_size = 2;
    config.artifact_dir = Some(artifacts.path().to_path_buf());
    config.cgroup = matches!(kiln::prepare_cgroup(&config.cg_root), Ok(true));
    config
}

pub(crate) fn sandbox(config: &Config) -> Arc<dyn Sandbox> {
    Arc::new(BoxPool::new(config, config.cgroup))
}
