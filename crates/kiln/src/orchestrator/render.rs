//! Plain-text rendering of job results
//!
//! Clients treat any response containing "error" (any case) as a failure,
//! so success bodies never contain that word and failure bodies always do.

use nix::sys::signal::Signal;

use crate::config::{Config, RenderConfig};
use crate::orchestrator::{JobError, JobOutcome, JobReport};
use crate::runner::CompileResult;
use crate::types::{ExecutionResult, ExitStatus, ResourceLimits};
use crate::validator::ValidationError;

pub const COMPILE_SUCCEEDED: &str = "Compilation successful!";
pub const COMPILE_FAILED: &str = "Compilation failed:";
pub const MISSING_PARAMETERS: &str = "Error: Missing action or code parameter";
pub const INVALID_ACTION: &str = "Error: Invalid action. Use 'compile' or 'run'";
pub const FORBIDDEN_CODE: &str =
    "Error: Code contains potentially dangerous operations and has been blocked for security reasons.";
pub const SERVER_BUSY: &str = "Error: server busy, try again later";
pub const INTERNAL_ERROR: &str = "Error: internal error";

/// Transport-level class of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    BadRequest,
    Busy,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub kind: ResponseKind,
    /// Job status, as in [`JobOutcome::status`]
    pub status: &'static str,
    pub body: String,
}

impl Rendered {
    pub fn bad_request(body: &str) -> Self {
        Self {
            kind: ResponseKind::BadRequest,
            status: "bad_request",
            body: body.to_owned(),
        }
    }

    /// Whether a client would read this body as a failure
    pub fn signals_failure(&self) -> bool {
        self.body.to_lowercase().contains("error")
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    include_warnings: bool,
    wall_time_ms: Option<u64>,
    memory_bytes: Option<u64>,
}

impl Renderer {
    pub fn new(render: &RenderConfig, limits: &ResourceLimits) -> Self {
        Self {
            include_warnings: render.include_warnings,
            wall_time_ms: limits.wall_time_ms,
            memory_bytes: limits.memory_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.render, &config.effective_limits(None))
    }

    pub fn result(&self, result: &Result<JobReport, JobError>) -> Rendered {
        match result {
            Ok(report) => self.report(report),
            Err(e) => self.error(e),
        }
    }

    pub fn report(&self, report: &JobReport) -> Rendered {
        let body = match &report.outcome {
            JobOutcome::Rejected(reason) => rejection(reason),
            JobOutcome::CompileFailed(compile) => self.compile_failure(compile),
            JobOutcome::Compiled(compile) => compile_success(compile),
            JobOutcome::Executed { compile, execution } => self.execution(compile, execution),
        };
        Rendered {
            kind: ResponseKind::Ok,
            status: report.outcome.status(),
            body,
        }
    }

    pub fn error(&self, error: &JobError) -> Rendered {
        let (kind, body) = match error {
            JobError::Busy(_) => (ResponseKind::Busy, SERVER_BUSY),
            _ => (ResponseKind::Internal, INTERNAL_ERROR),
        };
        Rendered {
            kind,
            status: error.status(),
            body: body.to_owned(),
        }
    }

    /// Compiler output is passed through as gcc printed it, caret lines and
    /// header notes included. The parsed list only fills in when gcc said
    /// nothing, e.g. a timeout or a driver crash.
    fn compile_failure(&self, compile: &CompileResult) -> String {
        let raw = compile.raw_output.trim_end();
        let details = if raw.is_empty() {
            compile
                .diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            raw.to_owned()
        };

        let mut body = format!("{COMPILE_FAILED}\n{details}");
        if !body.to_lowercase().contains("error") {
            body.push_str("\nerror: compilation did not succeed");
        }
        body.push('\n');
        body
    }

    fn execution(&self, compile: &CompileResult, execution: &ExecutionResult) -> String {
        let mut body = String::new();

        if self.include_warnings {
            for warning in compile.warnings() {
                body.push_str(&warning.to_string());
                body.push('\n');
            }
        }

        if let ExitStatus::Normal(code) = execution.exit_status
            && code != 0
        {
            body.push_str(&format!("Program exited with code: {code}\n"));
        }

        for stream in [&execution.stdout, &execution.stderr] {
            if stream.is_empty() {
                continue;
            }
            push_line_break(&mut body);
            body.push_str(&stream.to_text());
        }

        if let Some(label) = self.failure_label(execution.exit_status) {
            push_line_break(&mut body);
            body.push_str(&label);
            body.push('\n');
        }
        body
    }

    fn failure_label(&self, status: ExitStatus) -> Option<String> {
        let label = match status {
            ExitStatus::Normal(_) => return None,
            ExitStatus::TimedOut => match self.wall_time_ms {
                Some(ms) => format!(
                    "Error: Program execution timed out ({} seconds limit)",
                    seconds(ms)
                ),
                None => "Error: Program execution timed out".to_owned(),
            },
            ExitStatus::MemoryExceeded => match self.memory_bytes {
                Some(bytes) => format!(
                    "Error: Program exceeded its memory limit ({} MiB)",
                    bytes / ResourceLimits::MIB
                ),
                None => "Error: Program exceeded its memory limit".to_owned(),
            },
            ExitStatus::Signaled(signal) => match Signal::try_from(signal) {
                Ok(name) => format!(
                    "Error: Program terminated by signal {signal} ({})",
                    name.as_str()
                ),
                Err(_) => format!("Error: Program terminated by signal {signal}"),
            },
            ExitStatus::OutputTruncated => {
                "Error: Program exceeded the output limit and was stopped".to_owned()
            }
            ExitStatus::Killed => "Error: Program was stopped before it finished".to_owned(),
        };
        Some(label)
    }
}

fn rejection(reason: &ValidationError) -> String {
    match reason {
        ValidationError::Forbidden { .. } => FORBIDDEN_CODE.to_owned(),
        other => format!("Error: {other}"),
    }
}

fn compile_success(compile: &CompileResult) -> String {
    match compile.warnings().count() {
        0 => COMPILE_SUCCEEDED.to_owned(),
        1 => format!("{COMPILE_SUCCEEDED} (1 warning)"),
        n => format!("{COMPILE_SUCCEEDED} ({n} warnings)"),
    }
}

fn push_line_break(body: &mut String) {
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
}

fn seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{:.1}", ms as f64 / 1000.0)
    }
}
