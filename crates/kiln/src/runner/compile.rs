//! Compilation step
//!
//! Runs the configured C compiler over one translation unit in a fresh
//! workspace and keeps the binary as an [`Artifact`] when it succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::config::compiler::CompilerConfig;
use crate::diagnostics::{self, Diagnostic, Severity};
use crate::runner::{Artifact, CompileError, Finished, supervise};
use crate::sandbox::{ProcessReport, Sandbox, SandboxBox, SandboxError, SpawnRequest};
use crate::types::SandboxStatus;

/// Result of a compilation
#[derive(Debug)]
pub struct CompileResult {
    /// The compiler exited with code 0 and produced a binary
    pub success: bool,

    /// Parsed diagnostics, in compiler order
    pub diagnostics: Vec<Diagnostic>,

    /// Compiler stdout followed by stderr
    pub raw_output: String,

    /// Stopped at the compile time limit
    pub timed_out: bool,

    /// Present only when `success` is true
    pub artifact: Option<Artifact>,

    pub cpu_time: Duration,
    pub wall_time: Duration,
}

impl CompileResult {
    fn timed_out(report: &ProcessReport) -> Self {
        Self {
            success: false,
            diagnostics: vec![Diagnostic::error("compilation timed out")],
            raw_output: String::new(),
            timed_out: true,
            artifact: None,
            cpu_time: report.cpu_time,
            wall_time: report.wall_time,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success && self.artifact.is_some()
    }

    pub fn take_artifact(&mut self) -> Option<Artifact> {
        self.artifact.take()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}

/// Compiles submissions in workspaces taken from a [`Sandbox`]
pub struct Compiler {
    sandbox: Arc<dyn Sandbox>,
    config: CompilerConfig,
    artifact_dir: PathBuf,
}

impl Compiler {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &Config) -> Self {
        Self {
            sandbox,
            config: config.compiler.clone(),
            artifact_dir: config.artifact_dir(),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `source`. The workspace is released on every path.
    #[instrument(skip_all, fields(source_len = source.len()))]
    pub async fn compile(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<CompileResult, CompileError> {
        let mut workspace = self.sandbox.acquire().await?;
        debug!(box_id = workspace.id(), "acquired compile workspace");

        let result = self.compile_in(workspace.as_ref(), source, cancel).await;

        if let Err(e) = workspace.release().await {
            warn!(box_id = workspace.id(), error = %e, "failed to release compile workspace");
        }
        result
    }

    async fn compile_in(
        &self,
        workspace: &dyn SandboxBox,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<CompileResult, CompileError> {
        workspace
            .write_file(&self.config.source_name, source.as_bytes())
            .await?;

        let limits = self.config.effective_limits();
        let watchdog = limits.watchdog();
        let request = SpawnRequest {
            command: self.config.invocation(),
            stdin: Vec::new(),
            env: self.config.environment(),
            limits,
        };

        let mut process = workspace.spawn(request).await?;
        let report = match supervise(process.as_mut(), watchdog, cancel).await? {
            Finished::Exited(report) => report,
            Finished::Watchdog(report) => {
                warn!("compiler outlived its watchdog");
                return Ok(CompileResult::timed_out(&report));
            }
            Finished::Cancelled(_) => return Err(CompileError::Cancelled),
        };

        match report.status {
            SandboxStatus::TimeLimitExceeded => {
                debug!(message = ?report.message, "compilation timed out");
                return Ok(CompileResult::timed_out(&report));
            }
            SandboxStatus::InternalError => {
                let message = report
                    .message
                    .unwrap_or_else(|| "sandbox internal error".to_owned());
                return Err(SandboxError::Backend(message).into());
            }
            _ => {}
        }

        let raw_output = combine(&report);
        let mut diagnostics = diagnostics::parse(&raw_output);
        let success = report.status == SandboxStatus::Ok && report.exit_code == Some(0);

        debug!(
            success,
            exit_code = ?report.exit_code,
            status = ?report.status,
            diagnostics = diagnostics.len(),
            "compilation complete"
        );

        // A compiler that died silently (signal, memory cap) still has to fail loudly
        if !success && raw_output.trim().is_empty() {
            let message = report
                .message
                .clone()
                .unwrap_or_else(|| "compiler terminated abnormally".to_owned());
            diagnostics.push(Diagnostic::error(message));
        }

        let artifact = if success {
            let binary = workspace.read_file(&self.config.output_name).await?;
            Some(
                Artifact::store(&self.artifact_dir, binary)
                    .await
                    .map_err(CompileError::Artifact)?,
            )
        } else {
            None
        };

        Ok(CompileResult {
            success,
            diagnostics,
            raw_output,
            timed_out: false,
            artifact,
            cpu_time: report.cpu_time,
            wall_time: report.wall_time,
        })
    }
}

fn combine(report: &ProcessReport) -> String {
    let stdout = report.stdout.to_text();
    let stderr = report.stderr.to_text();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, _) => stderr,
        (false, true) => stdout,
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}
