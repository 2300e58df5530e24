//! Running commands inside an Isolate box
//!
//! Stdin is written to the workspace up front and stdout/stderr go to files,
//! so a program that reads past its input sees EOF instead of blocking.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::isolate::box_manager::IsolateBox;
use crate::isolate::command::IsolateCommand;
use crate::isolate::meta::MetaFile;
use crate::isolate::{IsolateError, open_box_file, resolve_command, validate_mounts};
use crate::sandbox::{ProcessReport, SandboxError, SandboxProcess, SpawnRequest};
use crate::types::CapturedOutput;

const STDIN_FILE: &str = "stdin.txt";
const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

/// How long isolate gets to tear the box down after SIGTERM
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Isolate's own diagnostics kept for error messages
const ISOLATE_STDERR_LIMIT: u64 = 16 * 1024;

/// An `isolate --run` invocation in its own process group
#[derive(Debug)]
pub struct IsolateProcess {
    box_id: u32,
    child: Child,
    pgid: Option<Pid>,
    meta_path: PathBuf,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    max_output: Option<u64>,
    isolate_stderr: Option<JoinHandle<Vec<u8>>>,
    exited: bool,
    terminated: bool,
}

impl IsolateProcess {
    #[instrument(skip(sandbox, request), fields(box_id = sandbox.id()))]
    pub async fn spawn(sandbox: &IsolateBox, request: SpawnRequest) -> Result<Self, IsolateError> {
        let settings = sandbox.settings();
        validate_mounts(&settings.mounts)?;

        let mut program = request.command;
        resolve_command(&mut program)?;

        let meta_path = sandbox.private_path("meta.txt");
        let stdout_path = sandbox.file_path(STDOUT_FILE)?;
        let stderr_path = sandbox.file_path(STDERR_FILE)?;

        // Outputs of an earlier run in the same box must not leak into this one
        for stale in [&meta_path, &stdout_path, &stderr_path] {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::fs::write(sandbox.file_path(STDIN_FILE)?, &request.stdin).await?;

        let max_output = request.limits.max_output_bytes;
        let args = IsolateCommand::new(&settings.isolate_path, sandbox.id())
            .cgroup(settings.cgroup)
            .limits(request.limits)
            .mounts(settings.mounts.iter().cloned())
            .envs(request.env)
            .meta_file(&meta_path)
            .stdin(sandbox.sandbox_path(STDIN_FILE)?)
            .stdout(sandbox.sandbox_path(STDOUT_FILE)?)
            .stderr(sandbox.sandbox_path(STDERR_FILE)?)
            .command(program)
            .build();

        debug!(?args, "spawning isolate");

        let (bin, rest) = args
            .split_first()
            .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_owned()))?;
        let mut child = Command::new(bin)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(IsolateError::SpawnFailed)?;

        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);
        let isolate_stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_limited(stderr, ISOLATE_STDERR_LIMIT)));

        Ok(Self {
            box_id: sandbox.id(),
            child,
            pgid,
            meta_path,
            stdout_path,
            stderr_path,
            max_output,
            isolate_stderr,
            exited: false,
            terminated: false,
        })
    }

    fn signal_group(&self, signal: Signal) {
        if let Some(pgid) = self.pgid
            && let Err(e) = killpg(pgid, signal)
        {
            debug!(box_id = self.box_id, ?signal, error = %e, "killpg failed");
        }
    }

    async fn isolate_stderr(&mut self) -> String {
        match self.isolate_stderr.take() {
            Some(handle) => handle
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_owned())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    async fn read_output(&self, path: &Path) -> Result<CapturedOutput, IsolateError> {
        read_output(path, self.max_output).await
    }
}

/// Read a stream the program wrote into the workspace, keeping at most
/// `max_output` bytes
async fn read_output(path: &Path, max_output: Option<u64>) -> Result<CapturedOutput, IsolateError> {
    let Some(mut file) = open_box_file(path).await? else {
        return Ok(CapturedOutput::default());
    };
    // One byte past the budget tells a full stream from a cut one
    let bytes = match max_output {
        Some(max) => read_limited(file, max.saturating_add(1)).await,
        None => {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            bytes
        }
    };
    Ok(CapturedOutput::capture(bytes, max_output))
}

async fn read_limited(reader: impl AsyncRead + Unpin, limit: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Err(e) = reader.take(limit).read_to_end(&mut bytes).await {
        debug!(error = %e, "stream read failed");
    }
    bytes
}

#[async_trait]
impl SandboxProcess for IsolateProcess {
    async fn wait(&mut self) -> Result<ProcessReport, SandboxError> {
        if !self.exited {
            let status = self.child.wait().await.map_err(IsolateError::Io)?;
            self.exited = true;
            debug!(box_id = self.box_id, ?status, "isolate exited");
        }

        if !self.meta_path.exists() {
            if self.terminated {
                return Ok(ProcessReport::signaled(Signal::SIGKILL as i32));
            }
            let stderr = self.isolate_stderr().await;
            return Err(IsolateError::CommandFailed(format!("no meta file produced: {stderr}")).into());
        }

        let meta = MetaFile::load(&self.meta_path).await?;
        let stdout = self.read_output(&self.stdout_path).await?;
        let stderr = self.read_output(&self.stderr_path).await?;
        let report = meta.to_report(stdout, stderr);

        debug!(
            box_id = self.box_id,
            status = ?report.status,
            cpu_time = ?report.cpu_time,
            memory_bytes = report.memory_bytes,
            "execution complete"
        );

        Ok(report)
    }

    #[instrument(skip(self), fields(box_id = self.box_id))]
    async fn terminate(&mut self) -> Result<(), SandboxError> {
        self.terminated = true;
        if self.exited {
            return Ok(());
        }

        // Isolate kills the box and reports when it catches SIGTERM
        self.signal_group(Signal::SIGTERM);
        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(status) => {
                status.map_err(IsolateError::Io)?;
            }
            Err(_) => {
                warn!("isolate ignored SIGTERM, killing process group");
                self.signal_group(Signal::SIGKILL);
                self.child.wait().await.map_err(IsolateError::Io)?;
            }
        }
        self.exited = true;
        Ok(())
    }
}

impl Drop for IsolateProcess {
    fn drop(&mut self) {
        if !self.exited {
            self.signal_group(Signal::SIGKILL);
        }
    }
}
