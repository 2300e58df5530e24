//! Meta file parsing for isolate
//!
//! Isolate writes one `key:value` pair per line after a run: time used,
//! memory used, exit status and why the process was stopped.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::isolate::IsolateError;
use crate::sandbox::ProcessReport;
use crate::types::{CapturedOutput, LimitExceeded, SandboxStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("meta file parse error at line {line_number}: {message} (line: {line:?})")]
pub struct MetaParseError {
    /// 1-indexed
    pub line_number: usize,
    pub line: String,
    pub message: String,
}

/// Parsed meta file from Isolate
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    pub entries: HashMap<String, String>,
}

impl MetaFile {
    /// Lenient parse that skips malformed lines. See [`try_parse`](Self::try_parse)
    /// for the strict variant.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        Self { entries }
    }

    /// Strict parse: any non-empty line without a `key:` prefix is an error
    pub fn try_parse(content: &str) -> Result<Self, MetaParseError> {
        let mut entries = HashMap::new();

        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let error = |message: &str| MetaParseError {
                line_number: idx + 1,
                line: line.to_owned(),
                message: message.to_owned(),
            };

            let (key, value) = trimmed
                .split_once(':')
                .ok_or_else(|| error("missing colon separator"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(error("empty key before colon"));
            }
            entries.insert(key.to_owned(), value.trim().to_owned());
        }

        Ok(Self { entries })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::try_parse(&content).map_err(|e| IsolateError::MetaParseFailed(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Missing status means the program exited with code 0
    pub fn status(&self) -> SandboxStatus {
        self.get("status")
            .map(SandboxStatus::from_isolate_status)
            .unwrap_or(SandboxStatus::Ok)
    }

    pub fn cpu_time(&self) -> Duration {
        self.seconds("time")
    }

    pub fn wall_time(&self) -> Duration {
        self.seconds("time-wall")
    }

    fn seconds(&self, key: &str) -> Duration {
        self.get_parsed::<f64>(key)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO)
    }

    /// Peak memory in bytes. Isolate reports kilobytes; the cgroup figure is
    /// preferred over max-rss when both are present.
    pub fn memory_bytes(&self) -> u64 {
        self.get_parsed::<u64>("cg-mem")
            .or_else(|| self.get_parsed("max-rss"))
            .unwrap_or(0)
            .saturating_mul(1024)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get_parsed("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.get_parsed("exitsig")
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(String::from)
    }

    pub fn killed(&self) -> bool {
        self.get("killed").is_some()
    }

    /// The cgroup OOM killer ended the program
    pub fn oom_killed(&self) -> bool {
        self.get("cg-oom-killed").is_some()
    }

    pub fn limit_exceeded(&self) -> LimitExceeded {
        let from_message = LimitExceeded::from_message(self.get("message"));
        if from_message.is_exceeded() {
            return from_message;
        }
        if self.oom_killed() {
            return LimitExceeded::Memory;
        }
        if self.status() == SandboxStatus::TimeLimitExceeded {
            return LimitExceeded::Time;
        }
        LimitExceeded::NotExceeded
    }

    pub fn to_report(&self, stdout: CapturedOutput, stderr: CapturedOutput) -> ProcessReport {
        ProcessReport {
            status: self.status(),
            limit_exceeded: self.limit_exceeded(),
            exit_code: self.exit_code(),
            signal: self.signal(),
            oom_killed: self.oom_killed(),
            cpu_time: self.cpu_time(),
            wall_time: self.wall_time(),
            memory_bytes: self.memory_bytes(),
            message: self.message(),
            stdout,
            stderr,
        }
    }
}
