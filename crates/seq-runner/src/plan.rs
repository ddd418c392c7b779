//! Plan file loading.
//!
//! A plan is a YAML document with a `settings` mapping (see [`RunConfig`]) and
//! an ordered `steps` list. Each step edits input-file lines either directly
//! (`params: { line23: "..." }`) or through the structured `time` group, which
//! is rendered onto the time-control line named by the layout:
//!
//! ```yaml
//! settings:
//!   source_dir: origin
//!   num_chunks: 20
//! steps:
//!   - name: "Step 1: Apply positive field"
//!     description: "mx0=100, phi0=40, 5000 steps"
//!     time: { kstep: 5000, kprint: 1000, kbackup: 1000 }
//!     params:
//!       line10: "1 0 0 1"
//!   - name: "Step 2: Relax"
//!     params:
//!       line8: "2000 1000 1000 5000"
//!       line10: "1 0 0 1"
//!     final_step: 7000
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::{InputLayout, RunConfig};
use crate::error::{Result, RunError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default)]
    settings: RunConfig,
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    time: Option<TimeGroup>,
    #[serde(default)]
    final_step: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeGroup {
    kstep: u64,
    kprint: u64,
    kbackup: u64,
    #[serde(default)]
    kstart: Option<u64>,
}

/// Fully resolved plan: settings plus the ordered steps.
#[derive(Debug, Clone)]
pub struct Plan {
    pub config: RunConfig,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Load a plan file; relative settings paths are anchored at its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| RunError::io(path, e))?;
        let plan = Self::from_yaml(&raw)?;
        let base = path.parent().unwrap_or(Path::new("."));
        let base = if base.as_os_str().is_empty() {
            Path::new(".")
        } else {
            base
        };
        Ok(Plan {
            config: plan.config.resolve_paths(base),
            steps: plan.steps,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: PlanFile =
            serde_yaml::from_str(raw).map_err(|e| RunError::Plan(e.to_string()))?;
        file.settings.check()?;
        let steps = resolve_steps(file.steps, &file.settings.layout)?;
        Ok(Plan {
            config: file.settings,
            steps,
        })
    }
}

/// One planned simulation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub description: String,
    /// 1-indexed line number to replacement body.
    pub params: BTreeMap<usize, String>,
    /// Cumulative simulation-time index reached at the end of this step.
    pub final_step: u64,
}

impl Step {
    /// Parsed time-control line, `None` when the step does not set it.
    pub fn time_control(
        &self,
        layout: &InputLayout,
    ) -> Option<std::result::Result<TimeControl, String>> {
        self.params
            .get(&layout.time_control_line)
            .map(|body| TimeControl::parse(body, &layout.comment_marker))
    }

    /// Whether the step tells the simulation to read the prior initial
    /// condition. `None` when the restart line is not edited by this step.
    pub fn reads_initial_condition(&self, layout: &InputLayout) -> Option<bool> {
        let body = self.params.get(&layout.restart_line)?;
        let flag = strip_annotation(body, &layout.comment_marker)
            .split_whitespace()
            .nth(layout.restart_flag_token);
        Some(flag.map(|t| t.parse::<i64>() == Ok(1)).unwrap_or(false))
    }
}

/// Values carried on the time-control line, in file order
/// `kstep kprint kbackup kstart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeControl {
    pub kstep: u64,
    pub kprint: u64,
    pub kbackup: u64,
    pub kstart: u64,
}

impl TimeControl {
    pub fn parse(body: &str, comment_marker: &str) -> std::result::Result<Self, String> {
        let tokens: Vec<&str> = strip_annotation(body, comment_marker)
            .split_whitespace()
            .collect();
        if tokens.len() < 4 {
            return Err(format!(
                "time-control line '{}' needs 4 values (kstep kprint kbackup kstart)",
                body.trim()
            ));
        }
        let field = |idx: usize, name: &str| {
            tokens[idx]
                .parse::<u64>()
                .map_err(|_| format!("{} '{}' is not a non-negative integer", name, tokens[idx]))
        };
        Ok(Self {
            kstep: field(0, "kstep")?,
            kprint: field(1, "kprint")?,
            kbackup: field(2, "kbackup")?,
            kstart: field(3, "kstart")?,
        })
    }

    /// `kstart + kstep`, `None` if it does not fit in a `u64`.
    pub fn end(&self) -> Option<u64> {
        self.kstart.checked_add(self.kstep)
    }
}

impl fmt::Display for TimeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.kstep, self.kprint, self.kbackup, self.kstart)
    }
}

pub(crate) fn strip_annotation<'a>(line: &'a str, marker: &str) -> &'a str {
    match line.find(marker) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_line_key(key: &str) -> Option<usize> {
    key.strip_prefix("line")?.parse::<usize>().ok()
}

fn resolve_steps(entries: Vec<StepEntry>, layout: &InputLayout) -> Result<Vec<Step>> {
    if entries.is_empty() {
        return Err(RunError::Plan("plan has no steps".to_string()));
    }
    let mut steps: Vec<Step> = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        let mut params = BTreeMap::new();
        for (key, body) in entry.params {
            let line = parse_line_key(&key).ok_or_else(|| {
                RunError::Plan(format!(
                    "step {} ({}): parameter key '{}' must look like lineN",
                    idx + 1,
                    entry.name,
                    key
                ))
            })?;
            if line == 0 {
                return Err(RunError::Plan(format!(
                    "step {} ({}): line numbers start at 1",
                    idx + 1,
                    entry.name
                )));
            }
            if body.trim_end_matches(['\r', '\n']).contains(['\r', '\n']) {
                return Err(RunError::Plan(format!(
                    "step {} ({}): {} must be a single line",
                    idx + 1,
                    entry.name,
                    key
                )));
            }
            params.insert(line, body);
        }

        let mut final_step = entry.final_step;
        if let Some(time) = entry.time {
            if params.contains_key(&layout.time_control_line) {
                return Err(RunError::Plan(format!(
                    "step {} ({}): set either `time` or line{}, not both",
                    idx + 1,
                    entry.name,
                    layout.time_control_line
                )));
            }
            let kstart = time
                .kstart
                .unwrap_or_else(|| steps.last().map(|s| s.final_step).unwrap_or(0));
            let tc = TimeControl {
                kstep: time.kstep,
                kprint: time.kprint,
                kbackup: time.kbackup,
                kstart,
            };
            let end = tc.end().ok_or_else(|| {
                RunError::Plan(format!(
                    "step {} ({}): kstart {} + kstep {} overflows",
                    idx + 1,
                    entry.name,
                    tc.kstart,
                    tc.kstep
                ))
            })?;
            params.insert(layout.time_control_line, tc.to_string());
            final_step.get_or_insert(end);
        }

        let final_step = final_step.ok_or_else(|| {
            RunError::Plan(format!(
                "step {} ({}): final_step is required unless a `time` group is given",
                idx + 1,
                entry.name
            ))
        })?;
        steps.push(Step {
            name: entry.name,
            description: entry.description,
            params,
            final_step,
        });
    }
    Ok(steps)
}
