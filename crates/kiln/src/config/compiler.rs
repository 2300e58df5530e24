use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ResourceLimits;

/// Default PATH for sandbox execution
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/bin:/bin";

/// Configuration for the C toolchain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Command and arguments with placeholders.
    /// Placeholders: {source}, {output}
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Source file name in the sandbox
    #[serde(default = "default_source_name")]
    pub source_name: String,

    /// Output binary name
    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// Append `-Werror` to the command
    #[serde(default)]
    pub warnings_as_errors: bool,

    /// Environment for the compiler. Nothing is inherited from the host.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// PATH inside the sandbox
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Resource limits for compilation (overrides defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl CompilerConfig {
    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, output: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| arg.replace("{source}", source).replace("{output}", output))
            .collect()
    }

    /// The full compiler invocation for this configuration
    pub fn invocation(&self) -> Vec<String> {
        let mut command =
            Self::expand_command(&self.command, &self.source_name, &self.output_name);
        if self.warnings_as_errors {
            command.push("-Werror".to_owned());
        }
        command
    }

    /// Environment passed to the compiler, PATH and locale included
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("PATH".to_owned(), self.path.clone()),
            ("LANG".to_owned(), "C".to_owned()),
            ("LC_ALL".to_owned(), "C".to_owned()),
        ]);
        env.extend(self.env.clone());
        env
    }

    /// Compile limits: built-in defaults, then the configured overrides
    pub fn effective_limits(&self) -> ResourceLimits {
        let base = ResourceLimits::compile_defaults();
        match self.limits {
            Some(ref limits) => base.with_overrides(limits),
            None => base,
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            source_name: default_source_name(),
            output_name: default_output_name(),
            warnings_as_errors: false,
            env: BTreeMap::new(),
            path: default_sandbox_path(),
            limits: None,
        }
    }
}

fn default_command() -> Vec<String> {
    [
        "gcc",
        "-std=gnu11",
        "-O2",
        "-Wall",
        "-fdiagnostics-color=never",
        "{source}",
        "-o",
        "{output}",
        "-lm",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_source_name() -> String {
    "main.c".to_owned()
}

fn default_output_name() -> String {
    "main".to_owned()
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}
