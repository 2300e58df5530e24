//! Execution step
//!
//! Runs a compiled [`Artifact`] in a fresh workspace under the execution
//! limits and classifies how it ended.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::runner::{Artifact, ExecuteError, Finished, supervise};
use crate::sandbox::{ProcessReport, Sandbox, SandboxBox, SandboxError, SpawnRequest};
use crate::types::{
    ExecutionEvent, ExecutionResult, ExecutionState, ExitStatus, LimitExceeded,
    ResourceLimits, SandboxStatus,
};

/// Name of the program inside the workspace
const PROGRAM: &str = "main";

/// SIGXFSZ, raised when the program writes past the file size cap
const SIGXFSZ: i32 = 25;

/// Share of the memory cap, in percent, above which a failed run is blamed
/// on memory. Under RLIMIT_AS the cap covers address space, so resident
/// memory of a program that ran out stays somewhat below it.
const NEAR_CAP_PERCENT: u64 = 80;

/// Runs artifacts in workspaces taken from a [`Sandbox`]
pub struct Executor {
    sandbox: Arc<dyn Sandbox>,
    limits: ResourceLimits,
}

impl Executor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &Config) -> Self {
        Self {
            sandbox,
            limits: config.effective_limits(None),
        }
    }

    /// Configured execution limits
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run `artifact` with `stdin` under `limits`.
    ///
    /// The artifact is consumed; its file is removed once copied into the
    /// workspace. The workspace is released on every path.
    #[instrument(skip_all, fields(artifact_len = artifact.len(), stdin_len = stdin.len()))]
    pub async fn execute(
        &self,
        artifact: Artifact,
        stdin: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        let binary = artifact.read().await.map_err(ExecuteError::Artifact)?;
        drop(artifact);

        let mut workspace = self.sandbox.acquire().await?;
        debug!(box_id = workspace.id(), "acquired execution workspace");

        let result = run_in(workspace.as_ref(), &binary, stdin, limits, cancel).await;

        if let Err(e) = workspace.release().await {
            warn!(box_id = workspace.id(), error = %e, "failed to release execution workspace");
        }
        result
    }
}

async fn run_in(
    workspace: &dyn SandboxBox,
    binary: &[u8],
    stdin: &[u8],
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, ExecuteError> {
    workspace.write_executable(PROGRAM, binary).await?;

    let request = SpawnRequest {
        command: vec![format!("./{PROGRAM}")],
        stdin: stdin.to_vec(),
        env: BTreeMap::new(),
        limits: limits.clone(),
    };

    let started = Instant::now();
    let mut state = ExecutionState::NotStarted;
    let mut process = workspace.spawn(request).await?;
    state = state.on(ExecutionEvent::Spawned)?;

    let (event, exit_status, report) =
        match supervise(process.as_mut(), limits.watchdog(), cancel).await? {
            Finished::Exited(report) => {
                let (event, exit_status) = classify(&report, limits)?;
                (event, exit_status, report)
            }
            Finished::Watchdog(report) => {
                warn!("program outlived its watchdog, terminated");
                (ExecutionEvent::ForciblyTerminated, ExitStatus::Killed, report)
            }
            Finished::Cancelled(report) => {
                debug!("execution cancelled");
                (ExecutionEvent::ForciblyTerminated, ExitStatus::Killed, report)
            }
        };
    let state = state.on(event)?;

    let duration = if report.wall_time.is_zero() {
        started.elapsed()
    } else {
        report.wall_time
    };

    debug!(
        %state,
        exit_status = exit_status.as_str(),
        cpu_time = ?report.cpu_time,
        memory_bytes = report.memory_bytes,
        "execution complete"
    );

    Ok(ExecutionResult {
        exit_status,
        state,
        stdout: report.stdout,
        stderr: report.stderr,
        duration,
        cpu_time: report.cpu_time,
        memory_bytes: report.memory_bytes,
    })
}

/// Map a sandbox report onto the executor's view of how the program ended
fn classify(
    report: &ProcessReport,
    limits: &ResourceLimits,
) -> Result<(ExecutionEvent, ExitStatus), SandboxError> {
    match report.status {
        SandboxStatus::InternalError => {
            let message = report
                .message
                .clone()
                .unwrap_or_else(|| "sandbox internal error".to_owned());
            return Err(SandboxError::Backend(message));
        }
        SandboxStatus::TimeLimitExceeded => {
            return Ok((ExecutionEvent::TimerExpired, ExitStatus::TimedOut));
        }
        _ => {}
    }

    if memory_exceeded(report, limits) {
        return Ok((ExecutionEvent::MemoryCapBreached, ExitStatus::MemoryExceeded));
    }

    let exit_status = if report.limit_exceeded == LimitExceeded::Output
        || report.signal == Some(SIGXFSZ)
    {
        ExitStatus::OutputTruncated
    } else if let (SandboxStatus::Signaled, Some(signal)) = (report.status, report.signal) {
        ExitStatus::Signaled(signal)
    } else {
        ExitStatus::Normal(report.exit_code.unwrap_or(0))
    };
    Ok((ExecutionEvent::Exited, exit_status))
}

/// Without cgroups there is no OOM flag: a program that hits RLIMIT_AS sees
/// failed allocations and either crashes or exits with an error.
fn memory_exceeded(report: &ProcessReport, limits: &ResourceLimits) -> bool {
    if report.oom_killed || report.limit_exceeded == LimitExceeded::Memory {
        return true;
    }
    let failed = matches!(
        report.status,
        SandboxStatus::Signaled | SandboxStatus::RuntimeError
    );
    if !failed {
        return false;
    }
    if LimitExceeded::from_message(report.message.as_deref()) == LimitExceeded::Memory {
        return true;
    }
    limits.memory_bytes.is_some_and(|cap| {
        u128::from(report.memory_bytes) * 100 >= u128::from(cap) * u128::from(NEAR_CAP_PERCENT)
    })
}
