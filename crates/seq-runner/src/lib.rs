//! Sequential chained simulation runs on a batch scheduler.
//!
//! A run copies a template directory into a fresh workspace, then for each
//! planned step rewrites input-file lines, submits the job, waits for it,
//! assembles the final state from the chunked output files and writes it back
//! as the next step's initial condition.

pub mod config;
pub mod error;
pub mod extract;
mod fsutil;
pub mod initial_condition;
pub mod inject;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod preview;
pub mod scheduler;
pub mod validate;
pub mod workspace;

pub use config::{ChunkPattern, InputLayout, RunConfig, SchedulerConfig};
pub use error::{Result, RunError, SchedulerError, Violation};
pub use extract::{extract_final_state, StateRecord};
pub use initial_condition::write_initial_condition;
pub use inject::{apply_edits, inject_params};
pub use monitor::{CancelToken, CancellableSleep, JobMonitor, WaitOutcome, Waiter};
pub use orchestrator::{RunSummary, StepOrchestrator, StepPhase, StepReport};
pub use plan::{Plan, Step, TimeControl};
pub use preview::{preview_plan, render_text, PlanPreview};
pub use scheduler::{submit_job, JobHandle, JobId, JobStatus, Scheduler, SlurmScheduler};
pub use validate::validate_steps;
pub use workspace::Workspace;
