//! Compile-and-run backend for untrusted C programs.
//!
//! Kiln takes C source from a client, checks it, compiles it and runs the
//! binary in an IOI Isolate sandbox with bounded CPU time, wall time, memory
//! and output, then reports the result as text.
//!
//! # Layers
//!
//! - [`validator`]: cheap static checks before anything is spawned
//! - [`runner`]: the compiler and the executor, both on top of the
//!   [`sandbox::Sandbox`] capability
//! - [`isolate`]: the Isolate backend of that capability
//! - [`orchestrator`]: admission control, job sequencing and text rendering

pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use diagnostics::{Diagnostic, Severity};
pub use isolate::{BoxPool, IsolateError, prepare_cgroup};
pub use orchestrator::{
    Action, Admission, Busy, JobError, JobOutcome, JobReport, Orchestrator, Rendered, Renderer,
    ResponseKind, Submission,
};
pub use runner::{Artifact, CompileError, CompileResult, Compiler, ExecuteError, Executor};
pub use sandbox::{Sandbox, SandboxError};
pub use types::{
    CapturedOutput, ExecutionResult, ExecutionState, ExitStatus, LimitExceeded, MountConfig,
    ResourceLimits, RuntimeFailure,
};
pub use validator::{ValidationError, Validator};

pub mod config;
pub mod diagnostics;
pub mod isolate;
pub mod orchestrator;
pub mod runner;
pub mod sandbox;
pub mod types;
pub mod validator;
