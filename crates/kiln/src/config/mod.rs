use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::compiler::{CompilerConfig, DEFAULT_SANDBOX_PATH};
use crate::types::{MountConfig, ResourceLimits};

pub mod compiler;
mod loader;

/// Example configuration embedded at compile time. Also the default configuration.
pub const EXAMPLE_CONFIG: &str = include_str!("../../kiln.example.toml");

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "KILN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid validator pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for kiln
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// With cgroups the memory cap applies to resident memory and an OOM kill is
    /// reported by the sandbox, which is how `MemoryExceeded` is detected reliably.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Directory holding compiled artifacts between compilation and execution.
    /// Defaults to a private directory under the system temp dir.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,

    /// Global directory mounts applied to all sandbox invocations
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Execution limits, layered over the built-in execution defaults
    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Sandbox pool sizing
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Number of isolate boxes, i.e. the cap on simultaneously sandboxed processes
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// First isolate box ID used by the pool
    #[serde(default)]
    pub first_box_id: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            first_box_id: 0,
        }
    }
}

/// Static checks on submitted source
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Reject sources matching `dangerous_patterns`
    #[serde(default = "default_true")]
    pub reject_dangerous: bool,

    /// Case-insensitive regular expressions
    #[serde(default)]
    pub dangerous_patterns: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: default_max_source_bytes(),
            reject_dangerous: true,
            dangerous_patterns: Vec::new(),
        }
    }
}

/// Admission control for compile/run jobs
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Jobs running at once in this process
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Jobs running or waiting at once for a single caller
    #[serde(default = "default_max_jobs_per_caller")]
    pub max_jobs_per_caller: usize,

    /// Jobs allowed to wait for a free slot
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize,

    /// How long a queued job waits before it is turned away
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_jobs_per_caller: default_max_jobs_per_caller(),
            max_queued_jobs: default_max_queued_jobs(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

/// Text rendering of job results
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderConfig {
    /// Prepend compiler warnings to program output on `run`
    #[serde(default)]
    pub include_warnings: bool,
}

/// HTTP front end settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path of the compile/run endpoint
    #[serde(default = "default_endpoint_path")]
    pub path: String,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_endpoint_path(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    /// Execution limits: built-in defaults, then config, then per-request overrides
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        let base = ResourceLimits::execution_defaults().with_overrides(&self.limits);
        match overrides {
            Some(limits) => base.with_overrides(limits),
            None => base,
        }
    }

    /// Directory for compiled artifacts
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-artifacts"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_pool_size() -> u32 {
    4
}

fn default_max_source_bytes() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_max_jobs_per_caller() -> usize {
    2
}

fn default_max_queued_jobs() -> usize {
    16
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_endpoint_path() -> String {
    "/CompilerServlet".to_owned()
}

fn default_max_body_bytes() -> usize {
    512 * 1024
}
