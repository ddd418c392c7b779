use std::fmt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, RunError, SchedulerError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submitted job and the last status seen for it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub status: JobStatus,
}

/// External batch scheduler.
pub trait Scheduler {
    /// Submit `script` with `workdir` as the job's working directory.
    fn submit(&self, workdir: &Path, script: &str) -> Result<JobId, SchedulerError>;

    fn status(&self, job: &JobId) -> Result<JobStatus, SchedulerError>;
}

/// Submit the step's job; a step cannot proceed without a tracked job.
pub fn submit_job<S: Scheduler + ?Sized>(
    scheduler: &S,
    workdir: &Path,
    script: &str,
) -> Result<JobHandle> {
    match scheduler.submit(workdir, script) {
        Ok(id) => {
            info!(job_id = %id, script, "job submitted");
            Ok(JobHandle {
                id,
                status: JobStatus::Queued,
            })
        }
        Err(err) => {
            let (stdout, stderr) = match &err {
                SchedulerError::Exit { stdout, stderr, .. } => (stdout.clone(), stderr.clone()),
                SchedulerError::Unparseable { output, .. } => (output.clone(), String::new()),
                SchedulerError::Spawn { .. } => (String::new(), String::new()),
            };
            Err(RunError::Submission {
                message: err.to_string(),
                stdout,
                stderr,
            })
        }
    }
}

/// Slurm via `sbatch` / `squeue` / `sacct`; command names come from
/// [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    config: SchedulerConfig,
}

struct CommandOutput {
    success: bool,
    code: String,
    stdout: String,
    stderr: String,
}

impl SlurmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn run(&self, mut cmd: Command, label: &str) -> Result<CommandOutput, SchedulerError> {
        let output = cmd.output().map_err(|e| SchedulerError::Spawn {
            command: label.to_string(),
            source: e,
        })?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// State recorded by accounting, terminal or not. `None` only when there
    /// is no record for the job at all.
    fn query_accounting(&self, job: &JobId) -> Result<Option<JobStatus>, SchedulerError> {
        let Some(acct) = self.config.accounting_command.as_deref() else {
            return Ok(None);
        };
        let mut cmd = Command::new(acct);
        cmd.args(["-n", "-X", "-P", "-j", &job.0, "-o", "State"]);
        let out = self.run(cmd, acct)?;
        if !out.success {
            return Err(SchedulerError::Exit {
                command: acct.to_string(),
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        let mut records = out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
        if records.peek().is_none() {
            return Ok(None);
        }
        match records.find_map(parse_accounting_state) {
            Some(status) => Ok(Some(status)),
            None => Err(SchedulerError::Unparseable {
                command: acct.to_string(),
                output: out.stdout,
            }),
        }
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, workdir: &Path, script: &str) -> Result<JobId, SchedulerError> {
        let submit = self.config.submit_command.as_str();
        let mut cmd = Command::new(submit);
        cmd.arg(script).current_dir(workdir);
        let out = self.run(cmd, submit)?;
        if !out.success {
            return Err(SchedulerError::Exit {
                command: submit.to_string(),
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        parse_submit_response(&out.stdout).ok_or(SchedulerError::Unparseable {
            command: submit.to_string(),
            output: out.stdout,
        })
    }

    fn status(&self, job: &JobId) -> Result<JobStatus, SchedulerError> {
        let queue = self.config.queue_command.as_str();
        let mut cmd = Command::new(queue);
        cmd.args(["-h", "-j", &job.0, "-o", "%T"]);
        let out = self.run(cmd, queue)?;
        let left_queue = if out.success {
            match out.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                Some(state) => {
                    return parse_queue_state(state).ok_or(SchedulerError::Unparseable {
                        command: queue.to_string(),
                        output: out.stdout.clone(),
                    })
                }
                None => true,
            }
        } else {
            // squeue rejects ids it has already purged
            out.stderr.contains("Invalid job id")
        };
        if !left_queue {
            return Err(SchedulerError::Exit {
                command: queue.to_string(),
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        match self.query_accounting(job)? {
            Some(status) => {
                if !status.is_terminal() {
                    // controller already purged it but accounting lags behind
                    debug!(job_id = %job, status = %status, "job off the queue, accounting still active");
                }
                Ok(status)
            }
            None => {
                warn!(job_id = %job, "job left the queue without an accounting record, assuming completed");
                Ok(JobStatus::Completed)
            }
        }
    }
}

/// `Submitted batch job 123` or `--parsable` output `123[;cluster]`.
pub fn parse_submit_response(stdout: &str) -> Option<JobId> {
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Submitted batch job") {
            let id = rest.split_whitespace().next()?;
            if id.chars().all(|c| c.is_ascii_digit()) {
                return Some(JobId(id.to_string()));
            }
        }
    }
    let last = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let id = last.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(JobId(id.to_string()))
    } else {
        None
    }
}

pub fn parse_queue_state(state: &str) -> Option<JobStatus> {
    match state.trim().to_ascii_uppercase().as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "SUSPENDED"
        | "RESIZING" => Some(JobStatus::Queued),
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => Some(JobStatus::Running),
        "COMPLETED" => Some(JobStatus::Completed),
        "CANCELLED" => Some(JobStatus::Cancelled),
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" | "BOOT_FAIL"
        | "DEADLINE" => Some(JobStatus::Failed),
        _ => None,
    }
}

/// sacct prints e.g. `CANCELLED by 1000`; only the first word matters.
/// Pending and running states are returned as-is so the caller keeps polling.
pub fn parse_accounting_state(line: &str) -> Option<JobStatus> {
    parse_queue_state(line.split_whitespace().next()?)
}
