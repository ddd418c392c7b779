use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::fsutil::{copy_dir_filtered, ensure_dir};

/// Directory (inside the workspace) for operator control files.
pub const CONTROL_DIR: &str = ".seqrun";
pub const STOP_FILE: &str = "stop";
pub const RUN_STATE_FILE: &str = "run_state.json";

/// Per-run execution directory, populated from the template directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    run_id: String,
    input_file: String,
    initial_condition_file: String,
}

impl Workspace {
    /// Create `seq_run_<timestamp>` under `runs_root` and copy the template
    /// into it.
    pub fn create(config: &RunConfig) -> Result<Self> {
        let run_id = format!("seq_run_{}", Local::now().format("%Y%m%d_%H%M%S"));
        Self::create_named(config, &run_id)
    }

    pub fn create_named(config: &RunConfig, run_id: &str) -> Result<Self> {
        if !config.source_dir.is_dir() {
            return Err(RunError::Environment(format!(
                "source directory not found: {}",
                config.source_dir.display()
            )));
        }
        ensure_dir(&config.runs_root)?;
        let root = config.runs_root.join(run_id);
        // create_dir (not create_dir_all): an existing directory means another
        // run owns it.
        fs::create_dir(&root).map_err(|e| {
            RunError::Environment(format!(
                "cannot create workspace {}: {}",
                root.display(),
                e
            ))
        })?;
        info!(
            workspace = %root.display(),
            source = %config.source_dir.display(),
            "creating workspace"
        );

        let exclude = config.exclude_set()?;
        let copied = copy_dir_filtered(
            &config.source_dir,
            &root,
            &exclude,
            &[config.initial_condition_file.as_str()],
        )?;
        info!(files = copied, "template copied");

        let workspace = Self {
            root,
            run_id: run_id.to_string(),
            input_file: config.input_file.clone(),
            initial_condition_file: config.initial_condition_file.clone(),
        };
        if workspace.initial_condition_path().is_file() {
            info!(
                file = %config.initial_condition_file,
                "initial condition carried over from template"
            );
        }
        let script = workspace.root.join(&config.job_script);
        if !script.is_file() {
            return Err(RunError::Environment(format!(
                "job script not found: {}",
                script.display()
            )));
        }
        if !workspace.input_path().is_file() {
            return Err(RunError::Environment(format!(
                "input file not found: {}",
                workspace.input_path().display()
            )));
        }
        Ok(workspace)
    }

    /// Reopen an existing workspace directory (used by `seqrun stop`).
    pub fn open(root: &Path, config: &RunConfig) -> Result<Self> {
        if !root.is_dir() {
            return Err(RunError::Environment(format!(
                "workspace not found: {}",
                root.display()
            )));
        }
        let run_id = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            root: root.to_path_buf(),
            run_id,
            input_file: config.input_file.clone(),
            initial_condition_file: config.initial_condition_file.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn input_path(&self) -> PathBuf {
        self.root.join(&self.input_file)
    }

    pub fn initial_condition_path(&self) -> PathBuf {
        self.root.join(&self.initial_condition_file)
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.root.join(RUN_STATE_FILE)
    }

    pub fn stop_path(&self) -> PathBuf {
        self.root.join(CONTROL_DIR).join(STOP_FILE)
    }

    /// Drop a stop request picked up by the monitor on its next wait.
    pub fn request_stop(&self) -> Result<PathBuf> {
        let path = self.stop_path();
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, chrono::Utc::now().to_rfc3339()).map_err(|e| RunError::io(&path, e))?;
        Ok(path)
    }

    /// `step<N>_backup`, N 1-indexed.
    pub fn backup_dir(&self, step_number: usize) -> Result<PathBuf> {
        let dir = self.root.join(format!("step{}_backup", step_number));
        ensure_dir(&dir)?;
        Ok(dir)
    }

    /// Copy the input file, the initial-condition file and `output_files`
    /// (relative to the workspace) into the step's backup directory. Every
    /// file must exist; a partial backup is an error.
    pub fn backup_step(&self, step_number: usize, output_files: &[String]) -> Result<PathBuf> {
        let dir = self.backup_dir(step_number)?;
        let mut names = vec![self.input_file.clone(), self.initial_condition_file.clone()];
        names.extend(output_files.iter().cloned());
        for name in &names {
            let src = self.root.join(name);
            let dst = dir.join(name);
            fs::copy(&src, &dst).map_err(|e| RunError::Archive {
                path: src.clone(),
                source: e,
            })?;
        }
        info!(dir = %dir.display(), files = names.len(), "step artifacts backed up");
        Ok(dir)
    }
}
