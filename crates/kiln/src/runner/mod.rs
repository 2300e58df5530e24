//! Compiling submissions and running the results
//!
//! Both steps take a fresh workspace from the [`Sandbox`](crate::sandbox::Sandbox),
//! supervise the process with a watchdog and a cancellation token, and
//! release the workspace before returning.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use crate::runner::artifact::Artifact;
pub use crate::runner::compile::{CompileResult, Compiler};
pub use crate::runner::execute::Executor;
use crate::sandbox::{ProcessReport, SandboxError, SandboxProcess};
use crate::types::InvalidTransition;

mod artifact;
mod compile;
mod execute;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("failed to store compiled program: {0}")]
    Artifact(#[source] std::io::Error),

    #[error("compilation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("failed to load compiled program: {0}")]
    Artifact(#[source] std::io::Error),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// How a supervised process stopped
#[derive(Debug)]
pub(crate) enum Finished {
    /// Ended on its own or was stopped by the sandbox's limits
    Exited(ProcessReport),
    /// Still running at the watchdog deadline and terminated
    Watchdog(ProcessReport),
    /// Terminated because the job was cancelled
    Cancelled(ProcessReport),
}

/// Wait for `process`, terminating it when the watchdog fires or the job is
/// cancelled. The process has been reaped when this returns.
pub(crate) async fn supervise(
    process: &mut dyn SandboxProcess,
    watchdog: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Finished, SandboxError> {
    enum Stop {
        Watchdog,
        Cancelled,
    }

    let deadline = async move {
        match watchdog {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };

    let stop = tokio::select! {
        biased;
        report = process.wait() => return Ok(Finished::Exited(report?)),
        () = cancel.cancelled() => Stop::Cancelled,
        () = deadline => Stop::Watchdog,
    };

    process.terminate().await?;
    let report = process.wait().await?;
    Ok(match stop {
        Stop::Watchdog => Finished::Watchdog(report),
        Stop::Cancelled => Finished::Cancelled(report),
    })
}
