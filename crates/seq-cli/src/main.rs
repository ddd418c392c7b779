use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use seq_runner::{
    preview_plan, render_text, validate_steps, CancelToken, CancellableSleep, Plan, PlanPreview,
    RunConfig, RunError, RunSummary, SlurmScheduler, StepOrchestrator, Workspace,
};

#[derive(Parser)]
#[command(name = "seqrun", version, about = "Run chained simulation steps on Slurm")]
struct Cli {
    /// Plan file with settings and steps
    #[arg(long, default_value = "seqrun.yaml", global = true)]
    plan: PathBuf,

    /// Validate and print the resolved plan, then exit
    #[arg(long)]
    preview: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    auto_yes: bool,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Increase console verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a running chain to stop at its next poll
    Stop { workspace: PathBuf },
    /// Write a starter plan file
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_kind(&err), format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    match &cli.command {
        Some(Commands::Init { force }) => init_plan(&cli.plan, *force, cli.json),
        Some(Commands::Stop { workspace }) => {
            let config = if cli.plan.is_file() {
                Plan::from_file(&cli.plan)?.config
            } else {
                RunConfig::default()
            };
            let path = Workspace::open(workspace, &config)?.request_stop()?;
            if cli.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stop",
                    "stop_file": path.display().to_string(),
                })));
            }
            println!("stop requested: {}", path.display());
            println!("the chain stops at its next status poll; the running job is left to Slurm");
            Ok(None)
        }
        None if cli.preview => {
            if !preview(&cli)?.valid {
                std::process::exit(1);
            }
            Ok(None)
        }
        None => run(&cli),
    }
}

fn load_plan(path: &Path) -> Result<Plan> {
    Plan::from_file(path).with_context(|| format!("loading plan {}", path.display()))
}

/// Print the resolved plan. Nothing is written: no workspace, no run log, no
/// scheduler call.
fn preview(cli: &Cli) -> Result<PlanPreview> {
    let plan = load_plan(&cli.plan)?;
    let preview = preview_plan(&plan);
    if cli.json {
        emit_json(&json!({
            "ok": preview.valid,
            "command": "preview",
            "preview": serde_json::to_value(&preview)?,
        }));
    } else {
        print!("{}", render_text(&preview));
    }
    Ok(preview)
}

fn run(cli: &Cli) -> Result<Option<Value>> {
    let plan = load_plan(&cli.plan)?;
    run_log_subscriber(cli.verbose, &plan.config.log_file)?.init();
    let stdin = io::stdin();
    let mut answers = stdin.lock();
    execute_logged(cli, &plan, &mut answers)
}

fn error_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<RunError>()
        .map(RunError::kind)
        .unwrap_or("command_failed")
}

/// Run the plan; a fatal error lands in the run log with the stage it came
/// from before it is returned.
fn execute_logged(cli: &Cli, plan: &Plan, answers: &mut dyn BufRead) -> Result<Option<Value>> {
    let mut stage = "validate";
    let result = execute(cli, plan, answers, &mut stage);
    if let Err(err) = &result {
        error!(
            component = stage,
            kind = error_kind(err),
            error = %format!("{:#}", err),
            "run aborted"
        );
    }
    result
}

fn execute(
    cli: &Cli,
    plan: &Plan,
    answers: &mut dyn BufRead,
    stage: &mut &'static str,
) -> Result<Option<Value>> {
    info!(plan = %cli.plan.display(), steps = plan.steps.len(), "plan loaded");
    if let Err(violations) = validate_steps(&plan.steps, &plan.config.layout) {
        for v in &violations {
            error!(step = v.step_index + 1, name = %v.step_name, "{}", v.message);
        }
        return Err(RunError::Configuration(violations).into());
    }

    *stage = "workspace";
    let workspace = Workspace::create(&plan.config)?;
    if !cli.json {
        print!("{}", render_text(&preview_plan(plan)));
        println!("\nworkspace: {}", workspace.root().display());
    }
    if !cli.auto_yes {
        *stage = "confirm";
        // prompt on stderr so --json output stays parseable
        if !confirm("Proceed with execution? [y/N] ", answers, &mut io::stderr())? {
            info!(workspace = %workspace.root().display(), "execution declined");
            if cli.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "executed": false,
                    "workspace": workspace.root().display().to_string(),
                })));
            }
            println!("Execution cancelled");
            return Ok(None);
        }
    }

    *stage = "orchestrator";
    let scheduler = SlurmScheduler::new(plan.config.scheduler.clone());
    let waiter = CancellableSleep::new(CancelToken::new()).with_stop_file(workspace.stop_path());
    let summary = StepOrchestrator::new(&plan.config, &workspace, &scheduler, &waiter)
        .run_all(&plan.steps)
        .with_context(|| format!("run {} aborted", workspace.run_id()))?;

    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "run",
            "executed": true,
            "run": summary_to_json(&summary),
        })));
    }
    println!("run_id: {}", summary.run_id);
    println!("workspace: {}", summary.workspace.display());
    for step in &summary.steps {
        println!(
            "step {}: {} job={} final_step={} backup={}",
            step.index + 1,
            step.name,
            step.job_id,
            step.final_step,
            step.backup_dir.display()
        );
    }
    println!("total_minutes: {:.1}", summary.duration.as_secs_f64() / 60.0);
    Ok(None)
}

fn confirm(prompt: &str, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<bool> {
    write!(out, "{}", prompt)?;
    out.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Console layer on stderr (RUST_LOG or -v) plus an append-only run log that
/// always records INFO and above.
fn run_log_subscriber(
    verbose: u8,
    log_file: &Path,
) -> Result<impl tracing::Subscriber + Send + Sync + 'static> {
    let console_filter = match std::env::var("RUST_LOG") {
        Ok(filter) => filter,
        Err(_) => match verbose {
            0 => "info".to_string(),
            1 => "info,seq_runner=debug".to_string(),
            _ => "debug,seq_runner=trace".to_string(),
        },
    };
    let console_filter =
        EnvFilter::try_new(&console_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening run log {}", log_file.display()))?;

    Ok(tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(io::stderr)
                .compact()
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::INFO),
        ))
}

fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "run_id": summary.run_id,
        "workspace": summary.workspace.display().to_string(),
        "duration_secs": summary.duration.as_secs(),
        "steps": summary.steps.iter().map(|s| json!({
            "index": s.index,
            "name": s.name,
            "job_id": s.job_id.0,
            "final_step": s.final_step,
            "backup_dir": s.backup_dir.display().to_string(),
            "duration_secs": s.duration.as_secs(),
        })).collect::<Vec<_>>(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

const STARTER_PLAN: &str = "\
settings:
  source_dir: origin                  # template directory copied into each run
  job_script: V-3.sh
  input_file: inputN.in
  initial_condition_file: pxyz.in
  num_chunks: 20                      # output files per step
  output_pattern: PELOOP.%08d.dat     # chunk c of a step is final_step + c
  poll_interval_secs: 60
  log_file: sequential_run.log
  runs_root: .
  # layout:
  #   time_control_line: 8            # kstep kprint kbackup kstart
  #   restart_line: 10                # first token 1 = read initial condition
steps:
  - name: 'Step 1: Apply field'
    description: ''
    time: { kstep: 5000, kprint: 1000, kbackup: 1000 }
    params:
      line10: '0 0 0 1'
  - name: 'Step 2: Relax'
    description: ''
    time: { kstep: 2000, kprint: 1000, kbackup: 1000 }   # kstart follows step 1
    params:
      line10: '1 0 0 1'
";

fn init_plan(path: &Path, force: bool, json: bool) -> Result<Option<Value>> {
    if !force && path.exists() {
        return Err(anyhow::anyhow!(
            "plan file already exists (use --force): {}",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_PLAN)?;
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": "init",
            "plan": path.display().to_string(),
        })));
    }
    println!("wrote: {}", path.display());
    println!("next: seqrun --plan {} --preview", path.display());
    Ok(None)
}
