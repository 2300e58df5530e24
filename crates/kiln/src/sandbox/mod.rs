//! Process isolation capability
//!
//! The compiler and executor only see these traits. [`crate::isolate::BoxPool`]
//! is the production backend; tests use the in-memory backend in
//! [`testing`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::isolate::IsolateError;
use crate::types::{CapturedOutput, LimitExceeded, ResourceLimits, SandboxStatus};

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Isolate(#[from] IsolateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file name: {0}")]
    InvalidPath(String),

    #[error("sandbox pool is closed")]
    Closed,

    #[error("sandbox backend error: {0}")]
    Backend(String),
}

/// Hands out exclusive, single-use workspaces
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Wait for a free workspace. At most [`capacity`](Self::capacity)
    /// workspaces exist at once.
    async fn acquire(&self) -> Result<Box<dyn SandboxBox>, SandboxError>;

    fn capacity(&self) -> usize;
}

/// One workspace: a private directory plus the limits its processes run under
#[async_trait]
pub trait SandboxBox: Send + Sync {
    fn id(&self) -> u32;

    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError>;

    /// Write a file the sandboxed process may execute
    async fn write_executable(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError>;

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError>;

    /// Start a process in the workspace
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, SandboxError>;

    /// Tear the workspace down. Idempotent; the slot returns to the pool even
    /// when teardown fails.
    async fn release(&mut self) -> Result<(), SandboxError>;
}

/// A running sandboxed process
#[async_trait]
pub trait SandboxProcess: Send {
    /// Wait for the process to end and collect its report. Cancel-safe: a
    /// dropped `wait` can be retried.
    async fn wait(&mut self) -> Result<ProcessReport, SandboxError>;

    /// Kill the process and everything it started
    async fn terminate(&mut self) -> Result<(), SandboxError>;
}

#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: Vec<String>,

    /// Written to the workspace in full before the process starts
    pub stdin: Vec<u8>,

    /// Complete environment; nothing is inherited
    pub env: BTreeMap<String, String>,

    pub limits: ResourceLimits,
}

/// What the sandbox observed about a finished process
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub status: SandboxStatus,
    pub limit_exceeded: LimitExceeded,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,

    /// Killed by the cgroup OOM killer
    pub oom_killed: bool,

    pub cpu_time: Duration,
    pub wall_time: Duration,

    /// Peak memory in bytes
    pub memory_bytes: u64,

    pub message: Option<String>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl ProcessReport {
    /// A process that exited on its own with `code`
    pub fn exited(code: i32) -> Self {
        Self {
            status: if code == 0 {
                SandboxStatus::Ok
            } else {
                SandboxStatus::RuntimeError
            },
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// A process that died from `signal`
    pub fn signaled(signal: i32) -> Self {
        Self {
            status: SandboxStatus::Signaled,
            signal: Some(signal),
            message: Some(format!("Caught fatal signal {signal}")),
            ..Self::default()
        }
    }
}

impl Default for ProcessReport {
    fn default() -> Self {
        Self {
            status: SandboxStatus::Ok,
            limit_exceeded: LimitExceeded::NotExceeded,
            exit_code: None,
            signal: None,
            oom_killed: false,
            cpu_time: Duration::ZERO,
            wall_time: Duration::ZERO,
            memory_bytes: 0,
            message: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }
}

/// Reject names that would escape the workspace directory
pub(crate) fn check_file_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty() || name.contains("..") || name.starts_with('/') || name.contains('\0') {
        return Err(SandboxError::InvalidPath(name.to_owned()));
    }
    Ok(())
}
