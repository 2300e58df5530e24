//! Static checks run on submitted source before anything touches the disk

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ValidatorConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("source is {size} bytes, the limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("source is empty")]
    Empty,

    #[error("source contains a NUL byte at offset {offset}")]
    NulByte { offset: usize },

    /// Matched one of the configured dangerous patterns
    #[error("source contains a forbidden construct")]
    Forbidden { pattern: String },
}

/// Compile the configured patterns, case-insensitively
pub fn compile_patterns(config: &ValidatorConfig) -> Result<Vec<Regex>, ConfigError> {
    config
        .dangerous_patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Validator {
    max_source_bytes: usize,
    patterns: Vec<Regex>,
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> Result<Self, ConfigError> {
        let patterns = if config.reject_dangerous {
            compile_patterns(config)?
        } else {
            Vec::new()
        };
        Ok(Self {
            max_source_bytes: config.max_source_bytes,
            patterns,
        })
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Check `source`. The size check runs before any other inspection.
    pub fn validate(&self, source: &str) -> Result<(), ValidationError> {
        if source.len() > self.max_source_bytes {
            return Err(ValidationError::TooLarge {
                size: source.len(),
                max: self.max_source_bytes,
            });
        }

        if source.trim().is_empty() {
            return Err(ValidationError::Empty);
        }

        if let Some(offset) = source.bytes().position(|b| b == 0) {
            return Err(ValidationError::NulByte { offset });
        }

        if let Some(pattern) = self.patterns.iter().find(|re| re.is_match(source)) {
            debug!(pattern = pattern.as_str(), "source matched dangerous pattern");
            return Err(ValidationError::Forbidden {
                pattern: pattern.as_str().to_owned(),
            });
        }

        Ok(())
    }
}
