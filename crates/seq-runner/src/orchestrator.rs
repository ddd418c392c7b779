use chrono::Utc;
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span};

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::extract::{chunk_file_names, extract_final_state};
use crate::fsutil::atomic_write_json_pretty;
use crate::initial_condition::write_initial_condition;
use crate::inject::inject_params;
use crate::monitor::{JobMonitor, Waiter};
use crate::plan::Step;
use crate::scheduler::{submit_job, JobId, JobStatus, Scheduler};
use crate::validate::validate_steps;
use crate::workspace::Workspace;

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Prepared,
    Submitted,
    Monitoring,
    Extracted,
    Archived,
    Done,
    Failed,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Prepared => "prepared",
            StepPhase::Submitted => "submitted",
            StepPhase::Monitoring => "monitoring",
            StepPhase::Extracted => "extracted",
            StepPhase::Archived => "archived",
            StepPhase::Done => "done",
            StepPhase::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: StepPhase) -> bool {
        use StepPhase::*;
        match (self, next) {
            (Done, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Prepared, Submitted)
            | (Submitted, Monitoring)
            | (Monitoring, Extracted)
            | (Extracted, Archived)
            | (Archived, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub job_id: JobId,
    pub final_step: u64,
    pub backup_dir: PathBuf,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub workspace: PathBuf,
    pub steps: Vec<StepReport>,
    pub duration: Duration,
}

/// Persists run progress to `run_state.json` in the workspace. If dropped
/// before [`RunState::finish`], the file is left marked failed.
struct RunState<'w> {
    workspace: &'w Workspace,
    total_steps: usize,
    completed: Vec<Value>,
    current: Option<Value>,
    done: bool,
}

impl<'w> RunState<'w> {
    fn new(workspace: &'w Workspace, total_steps: usize) -> Self {
        Self {
            workspace,
            total_steps,
            completed: Vec::new(),
            current: None,
            done: false,
        }
    }

    fn write(&self, status: &str) -> Result<()> {
        let payload = json!({
            "schema_version": "run_state_v1",
            "run_id": self.workspace.run_id(),
            "status": status,
            "total_steps": self.total_steps,
            "current_step": self.current,
            "completed_steps": self.completed,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.workspace.run_state_path(), &payload)
    }

    fn finish(&mut self, status: &str) -> Result<()> {
        self.current = None;
        self.write(status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunState<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write("failed");
        }
    }
}

/// Tracks one step through its phases, rejecting out-of-order transitions.
struct StepTracker<'s, 'w> {
    state: &'s mut RunState<'w>,
    index: usize,
    name: String,
    phase: StepPhase,
    job_id: Option<JobId>,
    started_at: String,
}

impl<'s, 'w> StepTracker<'s, 'w> {
    fn start(state: &'s mut RunState<'w>, index: usize, step: &Step) -> Result<Self> {
        let mut tracker = Self {
            state,
            index,
            name: step.name.clone(),
            phase: StepPhase::Prepared,
            job_id: None,
            started_at: Utc::now().to_rfc3339(),
        };
        tracker.persist("running")?;
        info!(phase = %tracker.phase, "step phase");
        Ok(tracker)
    }

    fn snapshot(&self) -> Value {
        json!({
            "index": self.index,
            "name": self.name,
            "phase": self.phase.as_str(),
            "job_id": self.job_id.as_ref().map(|j| j.0.clone()),
            "started_at": self.started_at,
        })
    }

    fn persist(&mut self, status: &str) -> Result<()> {
        self.state.current = Some(self.snapshot());
        self.state.write(status)
    }

    fn advance(&mut self, next: StepPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(RunError::Internal(format!(
                "illegal step transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        info!(phase = %next, "step phase");
        if next == StepPhase::Done {
            let mut record = self.snapshot();
            record["finished_at"] = json!(Utc::now().to_rfc3339());
            self.state.completed.push(record);
        }
        self.persist("running")
    }

    fn fail(&mut self, err: &RunError, component: &str) {
        let from = self.phase;
        self.phase = StepPhase::Failed;
        error!(
            step = %self.name,
            component,
            from = %from,
            kind = err.kind(),
            error = %err,
            "step failed"
        );
        let status = if matches!(err, RunError::Cancelled) {
            "cancelled"
        } else {
            "failed"
        };
        let mut snap = self.snapshot();
        snap["failed_in"] = json!(component);
        snap["error"] = json!(err.to_string());
        self.state.current = Some(snap);
        if self.state.write(status).is_ok() {
            self.state.done = true;
        }
    }
}

/// Drives every step of a validated plan through
/// inject, submit, monitor, extract, write and backup, strictly in order.
pub struct StepOrchestrator<'a, S: Scheduler + ?Sized, W: Waiter + ?Sized> {
    config: &'a RunConfig,
    workspace: &'a Workspace,
    scheduler: &'a S,
    waiter: &'a W,
}

impl<'a, S: Scheduler + ?Sized, W: Waiter + ?Sized> StepOrchestrator<'a, S, W> {
    pub fn new(config: &'a RunConfig, workspace: &'a Workspace, scheduler: &'a S, waiter: &'a W) -> Self {
        Self {
            config,
            workspace,
            scheduler,
            waiter,
        }
    }

    /// Run all steps. The first failure aborts the whole chain: later steps
    /// depend on this step's output.
    pub fn run_all(&self, steps: &[Step]) -> Result<RunSummary> {
        validate_steps(steps, &self.config.layout).map_err(RunError::Configuration)?;
        let started = Instant::now();
        let mut state = RunState::new(self.workspace, steps.len());
        state.write("running")?;
        info!(
            run_id = self.workspace.run_id(),
            workspace = %self.workspace.root().display(),
            steps = steps.len(),
            "starting sequential execution"
        );

        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let span = info_span!("step", n = index + 1, of = steps.len(), step = %step.name);
            let _entered = span.enter();
            if !step.description.is_empty() {
                info!(description = %step.description, "step started");
            } else {
                info!("step started");
            }
            let report = self.run_step(&mut state, index, step)?;
            info!(
                job_id = %report.job_id,
                minutes = report.duration.as_secs() / 60,
                "step completed"
            );
            reports.push(report);
        }

        state.finish("completed")?;
        info!(run_id = self.workspace.run_id(), "all steps completed");
        Ok(RunSummary {
            run_id: self.workspace.run_id().to_string(),
            workspace: self.workspace.root().to_path_buf(),
            steps: reports,
            duration: started.elapsed(),
        })
    }

    fn run_step(&self, state: &mut RunState<'_>, index: usize, step: &Step) -> Result<StepReport> {
        let started = Instant::now();
        let mut tracker = StepTracker::start(state, index, step)?;
        macro_rules! attempt {
            ($component:expr, $op:expr) => {
                match $op {
                    Ok(v) => v,
                    Err(err) => {
                        tracker.fail(&err, $component);
                        return Err(err);
                    }
                }
            };
        }

        attempt!("inject", self.prepare(step));
        let mut handle = attempt!(
            "submit",
            submit_job(self.scheduler, self.workspace.root(), &self.config.job_script)
        );
        tracker.job_id = Some(handle.id.clone());
        attempt!("state", tracker.advance(StepPhase::Submitted));
        attempt!("state", tracker.advance(StepPhase::Monitoring));

        let monitor = JobMonitor::new(
            self.scheduler,
            self.waiter,
            self.config.poll_interval(),
            self.config.scheduler.max_query_failures,
        );
        let status = attempt!("monitor", monitor.wait_for(&mut handle));
        if status != JobStatus::Completed {
            let err = RunError::JobFailure {
                job_id: handle.id.clone(),
                status,
            };
            tracker.fail(&err, "monitor");
            return Err(err);
        }

        let state_record = attempt!(
            "extract",
            extract_final_state(
                self.workspace.root(),
                &self.config.output_pattern,
                self.config.num_chunks,
                step.final_step,
            )
        );
        attempt!(
            "write_initial_condition",
            write_initial_condition(&self.workspace.initial_condition_path(), &state_record)
        );
        attempt!("state", tracker.advance(StepPhase::Extracted));

        let outputs = attempt!(
            "backup",
            chunk_file_names(&self.config.output_pattern, self.config.num_chunks, step.final_step)
        );
        let backup_dir = attempt!("backup", self.workspace.backup_step(index + 1, &outputs));
        attempt!("state", tracker.advance(StepPhase::Archived));
        attempt!("state", tracker.advance(StepPhase::Done));

        Ok(StepReport {
            index,
            name: step.name.clone(),
            job_id: handle.id,
            final_step: step.final_step,
            backup_dir,
            duration: started.elapsed(),
        })
    }

    /// Inject the step's line edits and check that a step reading the prior
    /// initial condition actually has one.
    fn prepare(&self, step: &Step) -> Result<()> {
        inject_params(
            &self.workspace.input_path(),
            &step.params,
            &self.config.layout.comment_marker,
        )?;
        if step.reads_initial_condition(&self.config.layout) == Some(true)
            && !self.workspace.initial_condition_path().is_file()
        {
            return Err(RunError::Environment(format!(
                "step reads the prior initial condition but {} does not exist",
                self.workspace.initial_condition_path().display()
            )));
        }
        Ok(())
    }
}
