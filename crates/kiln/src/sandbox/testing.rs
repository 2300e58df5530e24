//! In-memory sandbox backend
//!
//! Runs nothing. A behavior closure decides what each spawned "process"
//! reports, and counters record how the backend was used so tests can check
//! pool bounds and that every workspace was released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::sandbox::{
    ProcessReport, Sandbox, SandboxBox, SandboxError, SandboxProcess, SpawnRequest,
    check_file_name,
};
use crate::types::{CapturedOutput, LimitExceeded, SandboxStatus};

pub type Files = BTreeMap<String, Vec<u8>>;
type Behavior = dyn Fn(&SpawnRequest, &Files) -> FakeOutcome + Send + Sync;

/// Usage counters shared by a [`FakeSandbox`] and everything it hands out
#[derive(Debug, Default)]
pub struct FakeStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    spawned: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most processes ever running at the same time
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// What a fake process does
#[derive(Debug, Clone)]
pub struct FakeOutcome {
    report: ProcessReport,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    delay: Duration,
    files: Vec<(String, Vec<u8>)>,
    /// Keep running past the wall limit, as if the sandbox failed to stop it
    ignore_limits: bool,
}

impl FakeOutcome {
    pub fn exit(code: i32) -> Self {
        Self::from_report(ProcessReport::exited(code))
    }

    pub fn from_report(report: ProcessReport) -> Self {
        Self {
            report,
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
            files: Vec::new(),
            ignore_limits: false,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self::from_report(ProcessReport::signaled(signal))
    }

    /// Killed by the OOM killer at the memory cap
    pub fn out_of_memory(request: &SpawnRequest) -> Self {
        Self::from_report(ProcessReport {
            oom_killed: true,
            memory_bytes: request.limits.memory_bytes.unwrap_or(0),
            ..ProcessReport::signaled(9)
        })
    }

    /// Stopped by the hard file-size cap
    pub fn file_size_exceeded() -> Self {
        Self::from_report(ProcessReport {
            limit_exceeded: LimitExceeded::Output,
            message: Some("File size limit exceeded".to_owned()),
            ..ProcessReport::signaled(25)
        })
    }

    /// Never finishes on its own
    pub fn hang() -> Self {
        Self {
            delay: Duration::from_secs(3600),
            ignore_limits: true,
            ..Self::exit(0)
        }
    }

    /// Runs until the wall limit stops it
    pub fn run_forever() -> Self {
        Self {
            delay: Duration::from_secs(3600),
            ..Self::exit(0)
        }
    }

    pub fn stdout(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdout = bytes.into();
        self
    }

    pub fn stderr(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stderr = bytes.into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Leave a file in the workspace, like a compiler output
    pub fn file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.into(), contents.into()));
        self
    }
}

pub struct FakeSandbox {
    permits: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU32,
    stats: Arc<FakeStats>,
    behavior: Arc<Behavior>,
}

impl FakeSandbox {
    pub fn new(
        capacity: usize,
        behavior: impl Fn(&SpawnRequest, &Files) -> FakeOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            next_id: AtomicU32::new(0),
            stats: Arc::new(FakeStats::default()),
            behavior: Arc::new(behavior),
        }
    }

    /// A backend that behaves like a C toolchain.
    ///
    /// Compiling copies the source to the output binary, so running the
    /// binary can look at the source text. Markers in the source select the
    /// behavior:
    ///
    /// - `SYNTAX_ERROR`: compilation fails with an error diagnostic
    /// - `WARN_ME`: compilation succeeds with one warning
    /// - `ECHO_STDIN`: stdout is stdin
    /// - `SLEEP_FOREVER`: runs until the wall limit
    /// - `HANG`: ignores the wall limit
    /// - `ALLOC_TOO_MUCH`: OOM kill
    /// - `SEGFAULT`: SIGSEGV
    /// - `EXIT_3`: exit code 3
    /// - `SPAM`: a megabyte of stdout
    ///
    /// Anything else prints `hello\n` and exits 0.
    pub fn toolchain(capacity: usize) -> Self {
        Self::new(capacity, |request, files| {
            let program = request.command.first().map(String::as_str).unwrap_or("");
            if program.ends_with("cc") {
                compile(files)
            } else {
                run(request, files)
            }
        })
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }
}

fn compile(files: &Files) -> FakeOutcome {
    let source = files.get("main.c").cloned().unwrap_or_default();
    let text = String::from_utf8_lossy(&source);
    if text.contains("SYNTAX_ERROR") {
        return FakeOutcome::exit(1).stderr(
            "main.c: In function 'main':\n\
             main.c:3:5: error: expected ';' before '}' token\n",
        );
    }
    let mut outcome = FakeOutcome::exit(0).file("main", source.clone());
    if text.contains("WARN_ME") {
        outcome = outcome.stderr("main.c:2:9: warning: unused variable 'x' [-Wunused-variable]\n");
    }
    outcome
}

fn run(request: &SpawnRequest, files: &Files) -> FakeOutcome {
    let binary = files.get("main").cloned().unwrap_or_default();
    let text = String::from_utf8_lossy(&binary);
    if text.contains("ECHO_STDIN") {
        FakeOutcome::exit(0).stdout(request.stdin.clone())
    } else if text.contains("SLEEP_FOREVER") {
        FakeOutcome::run_forever()
    } else if text.contains("HANG") {
        FakeOutcome::hang()
    } else if text.contains("ALLOC_TOO_MUCH") {
        FakeOutcome::out_of_memory(request)
    } else if text.contains("SEGFAULT") {
        FakeOutcome::signaled(11)
    } else if text.contains("EXIT_3") {
        FakeOutcome::exit(3).stderr("bad input\n")
    } else if text.contains("SPAM") {
        FakeOutcome::exit(0).stdout(vec![b'x'; 1024 * 1024])
    } else {
        FakeOutcome::exit(0).stdout("hello\n")
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn acquire(&self) -> Result<Box<dyn SandboxBox>, SandboxError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Closed)?;
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBox {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            files: Mutex::new(Files::new()),
            permit: Some(permit),
            stats: Arc::clone(&self.stats),
            behavior: Arc::clone(&self.behavior),
        }))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

struct FakeBox {
    id: u32,
    files: Mutex<Files>,
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<FakeStats>,
    behavior: Arc<Behavior>,
}

impl FakeBox {
    fn files(&self) -> std::sync::MutexGuard<'_, Files> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SandboxBox for FakeBox {
    fn id(&self) -> u32 {
        self.id
    }

    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        check_file_name(name)?;
        self.files().insert(name.to_owned(), contents.to_vec());
        Ok(())
    }

    async fn write_executable(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.write_file(name, contents).await
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError> {
        check_file_name(name)?;
        self.files().get(name).cloned().ok_or_else(|| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{name} not found in box {}", self.id),
            ))
        })
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, SandboxError> {
        let outcome = {
            let mut files = self.files();
            let outcome = (self.behavior)(&request, &files);
            for (name, contents) in &outcome.files {
                files.insert(name.clone(), contents.clone());
            }
            outcome
        };

        self.stats.spawned.fetch_add(1, Ordering::SeqCst);
        let running = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_running.fetch_max(running, Ordering::SeqCst);

        let started = Instant::now();
        let wall = request.limits.wall_time_ms.map(Duration::from_millis);
        let (deadline, report) = match wall {
            Some(wall) if outcome.delay > wall && !outcome.ignore_limits => (
                started + wall,
                ProcessReport {
                    status: SandboxStatus::TimeLimitExceeded,
                    limit_exceeded: LimitExceeded::WallTime,
                    message: Some("Time limit exceeded (wall clock)".to_owned()),
                    ..ProcessReport::default()
                },
            ),
            _ => (started + outcome.delay, outcome.report.clone()),
        };

        Ok(Box::new(FakeProcess {
            started,
            deadline,
            report,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            max_output: request.limits.max_output_bytes,
            terminated: false,
            guard: Some(RunningGuard(Arc::clone(&self.stats))),
        }))
    }

    async fn release(&mut self) -> Result<(), SandboxError> {
        if self.permit.take().is_some() {
            self.files().clear();
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct RunningGuard(Arc<FakeStats>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeProcess {
    started: Instant,
    deadline: Instant,
    report: ProcessReport,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_output: Option<u64>,
    terminated: bool,
    guard: Option<RunningGuard>,
}

impl FakeProcess {
    fn finish(&mut self, mut report: ProcessReport) -> ProcessReport {
        self.guard = None;
        report.wall_time = self.started.elapsed();
        report.stdout = CapturedOutput::capture(std::mem::take(&mut self.stdout), self.max_output);
        report.stderr = CapturedOutput::capture(std::mem::take(&mut self.stderr), self.max_output);
        report
    }
}

#[async_trait]
impl SandboxProcess for FakeProcess {
    async fn wait(&mut self) -> Result<ProcessReport, SandboxError> {
        if !self.terminated {
            tokio::time::sleep_until(self.deadline).await;
        }
        let report = if self.terminated {
            ProcessReport::signaled(9)
        } else {
            self.report.clone()
        };
        Ok(self.finish(report))
    }

    async fn terminate(&mut self) -> Result<(), SandboxError> {
        self.terminated = true;
        Ok(())
    }
}
