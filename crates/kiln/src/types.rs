use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Marker appended to a stream that was cut at `max_output_bytes`
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in milliseconds
    #[serde(default)]
    pub cpu_time_ms: Option<u64>,

    /// Wall clock time limit in milliseconds
    #[serde(default)]
    pub wall_time_ms: Option<u64>,

    /// Memory limit in bytes
    #[serde(default)]
    pub memory_bytes: Option<u64>,

    /// Stack size limit in bytes
    #[serde(default)]
    pub stack_bytes: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Bytes of stdout and of stderr kept in the result (each stream separately)
    #[serde(default)]
    pub max_output_bytes: Option<u64>,

    /// Hard cap on any file the program writes, stdout and stderr included.
    /// Hitting it stops the program.
    #[serde(default)]
    pub hard_output_bytes: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Deny network access (the sandbox default)
    #[serde(default)]
    pub no_network: Option<bool>,

    /// Grace period past the wall limit before the executor kills the
    /// process group itself
    #[serde(default)]
    pub kill_grace_ms: Option<u64>,
}

impl ResourceLimits {
    /// 1 kibibyte in bytes
    pub const KIB: u64 = 1024;
    /// 1 mebibyte in bytes
    pub const MIB: u64 = 1024 * 1024;

    /// Limits applied to program execution when nothing else is configured
    pub fn execution_defaults() -> Self {
        Self {
            cpu_time_ms: Some(2_000),
            wall_time_ms: Some(5_000),
            memory_bytes: Some(256 * Self::MIB),
            stack_bytes: Some(64 * Self::MIB),
            max_processes: Some(1),
            max_output_bytes: Some(64 * Self::KIB),
            hard_output_bytes: Some(Self::MIB),
            max_open_files: Some(64),
            no_network: Some(true),
            kill_grace_ms: Some(1_000),
        }
    }

    /// Limits applied to the compiler when nothing else is configured
    pub fn compile_defaults() -> Self {
        Self {
            cpu_time_ms: Some(5_000),
            wall_time_ms: Some(10_000),
            memory_bytes: Some(512 * Self::MIB),
            stack_bytes: None,
            max_processes: Some(16),
            max_output_bytes: Some(64 * Self::KIB),
            hard_output_bytes: Some(16 * Self::MIB),
            max_open_files: Some(256),
            no_network: Some(true),
            kill_grace_ms: Some(2_000),
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu_time_ms(mut self, ms: u64) -> Self {
        self.cpu_time_ms = Some(ms);
        self
    }

    pub fn with_wall_time_ms(mut self, ms: u64) -> Self {
        self.wall_time_ms = Some(ms);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    pub fn with_no_network(mut self, deny: bool) -> Self {
        self.no_network = Some(deny);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_time_ms: overrides.cpu_time_ms.or(self.cpu_time_ms),
            wall_time_ms: overrides.wall_time_ms.or(self.wall_time_ms),
            memory_bytes: overrides.memory_bytes.or(self.memory_bytes),
            stack_bytes: overrides.stack_bytes.or(self.stack_bytes),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
            hard_output_bytes: overrides.hard_output_bytes.or(self.hard_output_bytes),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            no_network: overrides.no_network.or(self.no_network),
            kill_grace_ms: overrides.kill_grace_ms.or(self.kill_grace_ms),
        }
    }

    /// How long the executor waits before it terminates the process itself
    pub fn watchdog(&self) -> Option<Duration> {
        let wall = self.wall_time_ms?;
        Some(Duration::from_millis(
            wall.saturating_add(self.kill_grace_ms.unwrap_or(0)),
        ))
    }
}

/// One captured output stream, already cut to its byte budget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Keep at most `max` bytes of `bytes`
    pub fn capture(mut bytes: Vec<u8>, max: Option<u64>) -> Self {
        let Some(max) = max.and_then(|m| usize::try_from(m).ok()) else {
            return Self {
                bytes,
                truncated: false,
            };
        };
        let truncated = bytes.len() > max;
        bytes.truncate(max);
        Self { bytes, truncated }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 text with the truncation marker appended when cut
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// How a sandboxed program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    Normal(i32),
    Signaled(i32),
    TimedOut,
    MemoryExceeded,
    /// The program hit the hard output cap and was stopped
    OutputTruncated,
    /// Terminated by the executor (cancellation or watchdog)
    Killed,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Normal(0) => "completed",
            ExitStatus::Normal(_) => "nonzero_exit",
            ExitStatus::Signaled(_) => "signaled",
            ExitStatus::TimedOut => "timed_out",
            ExitStatus::MemoryExceeded => "memory_exceeded",
            ExitStatus::OutputTruncated => "output_truncated",
            ExitStatus::Killed => "killed",
        }
    }
}

/// Executor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    Killed,
}

/// Something that moves the executor state machine forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    Spawned,
    Exited,
    TimerExpired,
    MemoryCapBreached,
    ForciblyTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid executor transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: ExecutionState,
    pub event: ExecutionEvent,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::NotStarted | ExecutionState::Running)
    }

    pub fn on(self, event: ExecutionEvent) -> Result<Self, InvalidTransition> {
        use ExecutionEvent as E;
        use ExecutionState as S;

        match (self, event) {
            (S::NotStarted, E::Spawned) => Ok(S::Running),
            (S::Running, E::Exited) => Ok(S::Completed),
            (S::Running, E::TimerExpired) => Ok(S::TimedOut),
            (S::Running, E::MemoryCapBreached) => Ok(S::MemoryExceeded),
            (S::Running, E::ForciblyTerminated) => Ok(S::Killed),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::NotStarted => "not started",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed out",
            ExecutionState::MemoryExceeded => "memory exceeded",
            ExecutionState::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Result of running an artifact
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_status: ExitStatus,

    /// Terminal executor state
    pub state: ExecutionState,

    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,

    /// Wall clock time
    pub duration: Duration,

    /// CPU time reported by the sandbox
    pub cpu_time: Duration,

    /// Peak memory usage in bytes reported by the sandbox
    pub memory_bytes: u64,
}

impl ExecutionResult {
    /// Whether the program exited normally with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_status == ExitStatus::Normal(0)
    }

    pub fn failure(&self) -> Option<RuntimeFailure> {
        match self.exit_status {
            ExitStatus::Normal(0) => None,
            ExitStatus::Normal(code) => Some(RuntimeFailure::NonZeroExit(code)),
            ExitStatus::Signaled(signal) => Some(RuntimeFailure::Signaled(signal)),
            ExitStatus::TimedOut => Some(RuntimeFailure::TimedOut),
            ExitStatus::MemoryExceeded => Some(RuntimeFailure::MemoryExceeded),
            ExitStatus::OutputTruncated => Some(RuntimeFailure::OutputLimit),
            ExitStatus::Killed => Some(RuntimeFailure::Killed),
        }
    }

    pub fn output_truncated(&self) -> bool {
        self.stdout.truncated || self.stderr.truncated
    }
}

/// Reasons a program run counts as failed. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFailure {
    TimedOut,
    MemoryExceeded,
    Signaled(i32),
    NonZeroExit(i32),
    OutputLimit,
    Killed,
}

/// Status reported by the sandbox backend.
/// Corresponds to IOI Isolate two-letter status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    #[serde(rename = "OK")]
    Ok,

    /// Non-zero exit code
    #[serde(rename = "RE")]
    RuntimeError,

    #[serde(rename = "TO")]
    TimeLimitExceeded,

    #[serde(rename = "SG")]
    Signaled,

    /// Internal error in the sandbox itself
    #[serde(rename = "XX")]
    InternalError,
}

impl SandboxStatus {
    /// Parse status from isolate meta file status string
    pub fn from_isolate_status(status: &str) -> Self {
        match status {
            "OK" => SandboxStatus::Ok,
            "RE" => SandboxStatus::RuntimeError,
            "TO" => SandboxStatus::TimeLimitExceeded,
            "SG" => SandboxStatus::Signaled,
            _ => SandboxStatus::InternalError,
        }
    }
}

/// Secondary status indicating which resource limit was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitExceeded {
    #[default]
    #[serde(rename = "none")]
    NotExceeded,

    #[serde(rename = "time")]
    Time,

    #[serde(rename = "wall_time")]
    WallTime,

    #[serde(rename = "memory")]
    Memory,

    #[serde(rename = "output")]
    Output,
}

impl LimitExceeded {
    /// Infer which limit was exceeded from the sandbox message
    pub fn from_message(message: Option<&str>) -> Self {
        let Some(msg) = message else {
            return LimitExceeded::NotExceeded;
        };

        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("time limit") {
            if msg_lower.contains("wall") {
                LimitExceeded::WallTime
            } else {
                LimitExceeded::Time
            }
        } else if msg_lower.contains("memory") {
            LimitExceeded::Memory
        } else if msg_lower.contains("output") || msg_lower.contains("file size") {
            LimitExceeded::Output
        } else {
            LimitExceeded::NotExceeded
        }
    }

    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, LimitExceeded::NotExceeded)
    }
}

/// Configuration for a directory mount in the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (don't fail if source doesn't exist)
    #[serde(default)]
    pub optional: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_defaults_are_fully_populated() {
        let limits = ResourceLimits::execution_defaults();
        assert_eq!(limits.cpu_time_ms, Some(2_000));
        assert_eq!(limits.wall_time_ms, Some(5_000));
        assert_eq!(limits.memory_bytes, Some(256 * ResourceLimits::MIB));
        assert_eq!(limits.max_processes, Some(1));
        assert_eq!(limits.no_network, Some(true));
    }

    #[test]
    fn builder_methods() {
        let limits = ResourceLimits::new()
            .with_cpu_time_ms(500)
            .with_wall_time_ms(1_000)
            .with_memory_bytes(1024)
            .with_max_processes(4)
            .with_max_output_bytes(2048)
            .with_no_network(false);

        assert_eq!(limits.cpu_time_ms, Some(500));
        assert_eq!(limits.wall_time_ms, Some(1_000));
        assert_eq!(limits.memory_bytes, Some(1024));
        assert_eq!(limits.max_processes, Some(4));
        assert_eq!(limits.max_output_bytes, Some(2048));
        assert_eq!(limits.no_network, Some(false));
    }

    #[test]
    fn with_overrides_empty_preserves_base() {
        let base = ResourceLimits::execution_defaults();
        let result = base.with_overrides(&ResourceLimits::new());
        assert_eq!(result, base);
    }

    #[test]
    fn with_overrides_partial() {
        let base = ResourceLimits::execution_defaults();
        let overrides = ResourceLimits::new().with_wall_time_ms(100);
        let result = base.with_overrides(&overrides);
        assert_eq!(result.wall_time_ms, Some(100));
        assert_eq!(result.cpu_time_ms, base.cpu_time_ms);
    }

    #[test]
    fn watchdog_adds_grace() {
        let limits = ResourceLimits::execution_defaults();
        assert_eq!(limits.watchdog(), Some(Duration::from_millis(6_000)));
        assert_eq!(ResourceLimits::new().watchdog(), None);
    }

    #[test]
    fn capture_within_budget() {
        let out = CapturedOutput::capture(b"hello\n".to_vec(), Some(64));
        assert_eq!(out.bytes, b"hello\n");
        assert!(!out.truncated);
        assert_eq!(out.to_text(), "hello\n");
    }

    #[test]
    fn capture_truncates_and_marks() {
        let out = CapturedOutput::capture(b"abcdef".to_vec(), Some(3));
        assert_eq!(out.bytes, b"abc");
        assert!(out.truncated);
        assert_eq!(out.to_text(), format!("abc{TRUNCATION_MARKER}"));
    }

    #[test]
    fn capture_exact_budget_is_not_truncated() {
        let out = CapturedOutput::capture(b"abc".to_vec(), Some(3));
        assert!(!out.truncated);
    }

    #[test]
    fn state_machine_happy_path() {
        let state = ExecutionState::NotStarted
            .on(ExecutionEvent::Spawned)
            .unwrap();
        assert_eq!(state, ExecutionState::Running);
        assert_eq!(
            state.on(ExecutionEvent::Exited).unwrap(),
            ExecutionState::Completed
        );
    }

    #[test]
    fn state_machine_terminal_transitions() {
        let running = ExecutionState::Running;
        assert_eq!(
            running.on(ExecutionEvent::TimerExpired).unwrap(),
            ExecutionState::TimedOut
        );
        assert_eq!(
            running.on(ExecutionEvent::MemoryCapBreached).unwrap(),
            ExecutionState::MemoryExceeded
        );
        assert_eq!(
            running.on(ExecutionEvent::ForciblyTerminated).unwrap(),
            ExecutionState::Killed
        );
    }

    #[test]
    fn state_machine_rejects_invalid() {
        assert!(
            ExecutionState::NotStarted
                .on(ExecutionEvent::Exited)
                .is_err()
        );
        assert!(
            ExecutionState::Completed
                .on(ExecutionEvent::Spawned)
                .is_err()
        );
        assert!(ExecutionState::Killed.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
    }

    #[test]
    fn exit_status_failure_mapping() {
        let mut result = ExecutionResult {
            exit_status: ExitStatus::Normal(0),
            state: ExecutionState::Completed,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration: Duration::ZERO,
            cpu_time: Duration::ZERO,
            memory_bytes: 0,
        };
        assert!(result.is_success());
        assert_eq!(result.failure(), None);

        result.exit_status = ExitStatus::Normal(3);
        assert_eq!(result.failure(), Some(RuntimeFailure::NonZeroExit(3)));

        result.exit_status = ExitStatus::Signaled(11);
        assert_eq!(result.failure(), Some(RuntimeFailure::Signaled(11)));
    }

    #[test]
    fn limit_exceeded_from_message() {
        assert_eq!(
            LimitExceeded::from_message(Some("Time limit exceeded")),
            LimitExceeded::Time
        );
        assert_eq!(
            LimitExceeded::from_message(Some("Time limit exceeded (wall clock)")),
            LimitExceeded::WallTime
        );
        assert_eq!(
            LimitExceeded::from_message(Some("Out of memory")),
            LimitExceeded::Memory
        );
        assert_eq!(
            LimitExceeded::from_message(Some("File size limit exceeded")),
            LimitExceeded::Output
        );
        assert_eq!(LimitExceeded::from_message(None), LimitExceeded::NotExceeded);
    }

    #[test]
    fn sandbox_status_parse() {
        assert_eq!(SandboxStatus::from_isolate_status("OK"), SandboxStatus::Ok);
        assert_eq!(
            SandboxStatus::from_isolate_status("TO"),
            SandboxStatus::TimeLimitExceeded
        );
        assert_eq!(
            SandboxStatus::from_isolate_status("??"),
            SandboxStatus::InternalError
        );
    }
}
