use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RunError};

/// Process-wide settings. Built once from the plan file and handed to every
/// component by reference; nothing mutates it after loading.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub source_dir: PathBuf,
    pub job_script: String,
    pub input_file: String,
    pub initial_condition_file: String,
    pub num_chunks: usize,
    pub output_pattern: ChunkPattern,
    pub poll_interval_secs: u64,
    pub log_file: PathBuf,
    pub runs_root: PathBuf,
    pub copy_exclude: Vec<String>,
    pub layout: InputLayout,
    pub scheduler: SchedulerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("origin"),
            job_script: "V-3.sh".to_string(),
            input_file: "inputN.in".to_string(),
            initial_condition_file: "pxyz.in".to_string(),
            num_chunks: 20,
            output_pattern: ChunkPattern::default(),
            poll_interval_secs: 60,
            log_file: PathBuf::from("sequential_run.log"),
            runs_root: PathBuf::from("."),
            copy_exclude: vec![
                "*.dat".to_string(),
                "PELOOP.*".to_string(),
                "slurm-*".to_string(),
                "fort.*".to_string(),
            ],
            layout: InputLayout::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Anchor relative paths at `base` (the plan file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for path in [&mut self.source_dir, &mut self.log_file, &mut self.runs_root] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    pub fn exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.copy_exclude {
            let glob = Glob::new(pattern)
                .map_err(|e| RunError::Plan(format!("bad copy_exclude pattern '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| RunError::Plan(format!("copy_exclude: {}", e)))
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.num_chunks == 0 {
            return Err(RunError::Plan("num_chunks must be at least 1".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(RunError::Plan("poll_interval_secs must be at least 1".to_string()));
        }
        if self.layout.time_control_line == 0 || self.layout.restart_line == 0 {
            return Err(RunError::Plan("layout line numbers are 1-indexed".to_string()));
        }
        if self.layout.comment_marker.is_empty() {
            return Err(RunError::Plan("layout.comment_marker cannot be empty".to_string()));
        }
        self.exclude_set()?;
        Ok(())
    }
}

/// Where the structured parameter groups live inside the input file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputLayout {
    pub comment_marker: String,
    /// Line holding `kstep kprint kbackup kstart`.
    pub time_control_line: usize,
    /// Line holding the read-initial-condition flag.
    pub restart_line: usize,
    pub restart_flag_token: usize,
}

impl Default for InputLayout {
    fn default() -> Self {
        Self {
            comment_marker: "!".to_string(),
            time_control_line: 8,
            restart_line: 10,
            restart_flag_token: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub submit_command: String,
    pub queue_command: String,
    /// Set to null to treat "left the queue" as completion.
    pub accounting_command: Option<String>,
    /// Consecutive failed status queries tolerated before giving up.
    pub max_query_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            queue_command: "squeue".to_string(),
            accounting_command: Some("sacct".to_string()),
            max_query_failures: 30,
        }
    }
}

/// printf-style output file name with a single integer conversion, e.g.
/// `PELOOP.%08d.dat`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ChunkPattern {
    prefix: String,
    width: usize,
    zero_pad: bool,
    suffix: String,
}

impl ChunkPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = |why: &str| RunError::Plan(format!("output pattern '{}': {}", raw, why));
        let mut prefix = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                prefix.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                prefix.push('%');
                continue;
            }
            let mut conversion = String::new();
            for c in chars.by_ref() {
                conversion.push(c);
                if c == 'd' {
                    break;
                }
            }
            let digits = conversion
                .strip_suffix('d')
                .ok_or_else(|| bad("conversion must be %d"))?;
            let zero_pad = digits.starts_with('0');
            let width = if digits.is_empty() {
                0
            } else {
                digits.parse::<usize>().map_err(|_| bad("invalid width"))?
            };
            let suffix: String = chars.collect();
            if suffix.contains('%') {
                return Err(bad("only one conversion is allowed"));
            }
            return Ok(Self {
                prefix,
                width,
                zero_pad,
                suffix,
            });
        }
        Err(bad("missing %d conversion"))
    }

    pub fn render(&self, index: u64) -> String {
        if self.zero_pad {
            format!("{}{:0w$}{}", self.prefix, index, self.suffix, w = self.width)
        } else {
            format!("{}{:w$}{}", self.prefix, index, self.suffix, w = self.width)
        }
    }
}

impl Default for ChunkPattern {
    fn default() -> Self {
        Self {
            prefix: "PELOOP.".to_string(),
            width: 8,
            zero_pad: true,
            suffix: ".dat".to_string(),
        }
    }
}

impl TryFrom<String> for ChunkPattern {
    type Error = RunError;

    fn try_from(value: String) -> Result<Self> {
        ChunkPattern::parse(&value)
    }
}

impl fmt::Display for ChunkPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escape = |s: &str| s.replace('%', "%%");
        if self.zero_pad {
            write!(f, "{}%0{}d{}", escape(&self.prefix), self.width, escape(&self.suffix))
        } else if self.width > 0 {
            write!(f, "{}%{}d{}", escape(&self.prefix), self.width, escape(&self.suffix))
        } else {
            write!(f, "{}%d{}", escape(&self.prefix), escape(&self.suffix))
        }
    }
}
