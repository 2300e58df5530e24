//! Configuration file loading for kiln
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};
use crate::types::ResourceLimits;
use crate::validator::compile_patterns;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration the server runs with: the given file (or the
    /// embedded example), then `KILN_*` environment overrides such as
    /// `KILN_SERVER__BIND=0.0.0.0:8080`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::ReadFile {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no such file",
                        ),
                    });
                }
                ConfigBuilder::builder().add_source(File::from(path))
            }
            None => ConfigBuilder::builder()
                .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let compiler = &self.compiler;
        if compiler.command.is_empty() {
            return Err(ConfigError::Invalid("compiler command is empty".to_owned()));
        }
        for placeholder in ["{source}", "{output}"] {
            if !compiler.command.iter().any(|arg| arg.contains(placeholder)) {
                return Err(ConfigError::Invalid(format!(
                    "compiler command must contain {placeholder}"
                )));
            }
        }
        for name in [&compiler.source_name, &compiler.output_name] {
            if name.is_empty() || name.contains('/') || name.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "invalid file name in compiler config: {name:?}"
                )));
            }
        }

        if self.sandbox.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.pool_size must be at least 1".to_owned(),
            ));
        }
        if self.admission.max_concurrent_jobs == 0 || self.admission.max_jobs_per_caller == 0 {
            return Err(ConfigError::Invalid(
                "admission limits must be at least 1".to_owned(),
            ));
        }
        if self.validator.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "validator.max_source_bytes must be positive".to_owned(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/': {:?}",
                self.server.path
            )));
        }

        validate_limits("limits", &self.limits)?;
        if let Some(ref limits) = compiler.limits {
            validate_limits("compiler.limits", limits)?;
        }

        compile_patterns(&self.validator)?;

        Ok(())
    }
}

fn validate_limits(section: &str, limits: &ResourceLimits) -> Result<(), ConfigError> {
    let zero = [
        ("cpu_time_ms", limits.cpu_time_ms == Some(0)),
        ("wall_time_ms", limits.wall_time_ms == Some(0)),
        ("memory_bytes", limits.memory_bytes == Some(0)),
        ("max_processes", limits.max_processes == Some(0)),
    ];
    match zero.iter().find(|(_, is_zero)| *is_zero) {
        Some((field, _)) => Err(ConfigError::Invalid(format!(
            "{section}.{field} must be positive"
        ))),
        None => Ok(()),
    }
}
