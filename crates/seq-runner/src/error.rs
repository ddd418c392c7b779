use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::{JobId, JobStatus};

pub type Result<T, E = RunError> = std::result::Result<T, E>;

/// One structural problem found in the step plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// 0-based position of the offending step.
    pub step_index: usize,
    pub step_name: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ({}): {}",
            self.step_index + 1,
            self.step_name,
            self.message
        )
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("step plan failed validation:\n{}", join_violations(.0))]
    Configuration(Vec<Violation>),

    #[error("invalid plan: {0}")]
    Plan(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("job submission failed: {message} (stdout: {stdout:?}, stderr: {stderr:?})")]
    Submission {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("status queries for job {job_id} failed {failures} times in a row, last error: {last_error}")]
    Monitoring {
        job_id: JobId,
        failures: u32,
        last_error: String,
    },

    #[error("job {job_id} ended with status {status}")]
    JobFailure { job_id: JobId, status: JobStatus },

    #[error("cannot extract final state from {}: {message}", .path.display())]
    Extraction { path: PathBuf, message: String },

    #[error("backup of {} failed: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stop requested while waiting for job")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn extraction(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RunError::Extraction {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Short category name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Configuration(_) | RunError::Plan(_) => "configuration",
            RunError::Environment(_) => "environment",
            RunError::Submission { .. } => "submission",
            RunError::Monitoring { .. } => "monitoring",
            RunError::JobFailure { .. } => "job_failure",
            RunError::Extraction { .. } => "extraction",
            RunError::Archive { .. } => "archive",
            RunError::Cancelled => "cancelled",
            RunError::Internal(_) => "internal",
            RunError::Io { .. } => "io",
        }
    }
}

/// Failure of a single scheduler command. The monitor treats these as
/// transient; the submitter turns them into [`RunError::Submission`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code}: {stderr}")]
    Exit {
        command: String,
        code: String,
        stdout: String,
        stderr: String,
    },

    #[error("unrecognized response from `{command}`: {output:?}")]
    Unparseable { command: String, output: String },
}
