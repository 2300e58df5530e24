//! Job orchestration
//!
//! A job is one submission: validate, admit, compile, and for `run` execute.
//! The result is a typed [`JobOutcome`]; [`render`] flattens it to text.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use crate::orchestrator::admission::{Admission, AdmissionPermit, Busy};
pub use crate::orchestrator::render::{Rendered, Renderer, ResponseKind};
use crate::config::{Config, ConfigError};
use crate::runner::{CompileError, CompileResult, Compiler, ExecuteError, Executor};
use crate::sandbox::Sandbox;
use crate::types::ExecutionResult;
use crate::validator::{ValidationError, Validator};

mod admission;
pub mod render;

/// What the client asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Compile,
    Run,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Compile => "compile",
            Action::Run => "run",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action: {0:?}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(Action::Compile),
            "run" => Ok(Action::Run),
            other => Err(UnknownAction(other.to_owned())),
        }
    }
}

/// One request's worth of work
#[derive(Debug, Clone)]
pub struct Submission {
    pub action: Action,
    pub source: String,
    pub stdin: String,
}

impl Submission {
    pub fn new(action: Action, source: impl Into<String>) -> Self {
        Self {
            action,
            source: source.into(),
            stdin: String::new(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

/// How a job ended, before any rendering
#[derive(Debug)]
pub enum JobOutcome {
    /// Refused by the validator; nothing was spawned
    Rejected(ValidationError),
    CompileFailed(CompileResult),
    /// `compile` action succeeded
    Compiled(CompileResult),
    /// `run` action got as far as executing the program
    Executed {
        compile: CompileResult,
        execution: ExecutionResult,
    },
}

impl JobOutcome {
    /// Short machine-readable status
    pub fn status(&self) -> &'static str {
        match self {
            JobOutcome::Rejected(_) => "rejected",
            JobOutcome::CompileFailed(_) => "compile_failed",
            JobOutcome::Compiled(_) => "compiled",
            JobOutcome::Executed { execution, .. } => execution.exit_status.as_str(),
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub id: u64,
    pub action: Action,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("server busy: {0}")]
    Busy(#[from] Busy),

    #[error("job cancelled")]
    Cancelled,

    #[error("compilation could not run: {0}")]
    Compile(#[source] CompileError),

    #[error("execution could not run: {0}")]
    Execute(#[from] ExecuteError),

    #[error("job task failed: {0}")]
    Panicked(String),
}

impl From<CompileError> for JobError {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::Cancelled => JobError::Cancelled,
            other => JobError::Compile(other),
        }
    }
}

impl JobError {
    pub fn status(&self) -> &'static str {
        match self {
            JobError::Busy(_) => "busy",
            JobError::Cancelled => "cancelled",
            JobError::Compile(_) | JobError::Execute(_) | JobError::Panicked(_) => "internal",
        }
    }
}

struct ActiveJob;

impl ActiveJob {
    fn start() -> Self {
        gauge!("kiln_active_jobs").increment(1.0);
        ActiveJob
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        gauge!("kiln_active_jobs").decrement(1.0);
    }
}

/// Sequences validator, compiler and executor under admission control
pub struct Orchestrator {
    validator: Validator,
    compiler: Compiler,
    executor: Executor,
    admission: Admission,
    renderer: Renderer,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: &Config, sandbox: Arc<dyn Sandbox>) -> Result<Self, ConfigError> {
        Ok(Self {
            validator: Validator::new(&config.validator)?,
            compiler: Compiler::new(Arc::clone(&sandbox), config),
            executor: Executor::new(sandbox, config),
            admission: Admission::new(&config.admission),
            renderer: Renderer::from_config(config),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Run one job to completion in the current task
    #[instrument(skip_all, fields(job_id = tracing::field::Empty, caller = %caller, action = %submission.action))]
    pub async fn handle(
        &self,
        caller: &str,
        submission: Submission,
        cancel: &CancellationToken,
    ) -> Result<JobReport, JobError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("job_id", id);
        let started = Instant::now();
        let action = submission.action;

        let result = self.process(caller, submission, cancel).await;
        let elapsed = started.elapsed();

        let status = match &result {
            Ok(outcome) => outcome.status(),
            Err(e) => e.status(),
        };
        counter!("kiln_jobs_total", "action" => action.as_str(), "status" => status).increment(1);
        histogram!("kiln_job_duration_ms").record(elapsed.as_secs_f64() * 1000.0);

        match &result {
            Ok(_) => info!(status, ?elapsed, "job finished"),
            Err(JobError::Busy(busy)) => warn!(reason = busy.as_str(), "job turned away"),
            Err(JobError::Cancelled) => debug!(?elapsed, "job cancelled"),
            Err(e) => error!(error = %e, "job failed"),
        }

        result.map(|outcome| JobReport {
            id,
            action,
            outcome,
            elapsed,
        })
    }

    /// Run one job on its own task. The job keeps running (and cleans up)
    /// if the caller stops waiting; cancel it through `cancel`.
    pub async fn submit(
        self: &Arc<Self>,
        caller: String,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<JobReport, JobError> {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.handle(&caller, submission, &cancel).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "job task panicked");
                Err(JobError::Panicked(e.to_string()))
            }
        }
    }

    async fn process(
        &self,
        caller: &str,
        submission: Submission,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        if let Err(rejection) = self.validator.validate(&submission.source) {
            debug!(reason = %rejection, "submission rejected");
            return Ok(JobOutcome::Rejected(rejection));
        }

        let _permit = tokio::select! {
            admitted = self.admission.admit(caller) => admitted.inspect_err(|busy| {
                counter!("kiln_admission_rejected_total", "reason" => busy.as_str()).increment(1);
            })?,
            () = cancel.cancelled() => return Err(JobError::Cancelled),
        };
        let _active = ActiveJob::start();

        let mut compile = self.compiler.compile(&submission.source, cancel).await?;
        if !compile.success {
            return Ok(JobOutcome::CompileFailed(compile));
        }

        match submission.action {
            Action::Compile => {
                // Nothing will run it
                drop(compile.take_artifact());
                Ok(JobOutcome::Compiled(compile))
            }
            Action::Run => {
                let Some(artifact) = compile.take_artifact() else {
                    return Ok(JobOutcome::CompileFailed(compile));
                };
                let execution = self
                    .executor
                    .execute(
                        artifact,
                        submission.stdin.as_bytes(),
                        self.executor.limits(),
                        cancel,
                    )
                    .await?;
                Ok(JobOutcome::Executed { compile, execution })
            }
        }
    }
}
