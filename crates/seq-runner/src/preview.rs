use serde::Serialize;
use std::fmt::Write as _;

use crate::config::InputLayout;
use crate::plan::Plan;
use crate::validate::validate_steps;

#[derive(Debug, Clone, Serialize)]
pub struct LineEdit {
    pub line: usize,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepPreview {
    pub number: usize,
    pub name: String,
    pub description: String,
    pub final_step: u64,
    pub kstart: Option<u64>,
    pub kstep: Option<u64>,
    /// Simulation steps covered: `final_step` minus the previous step's.
    pub duration: u64,
    pub reads_initial_condition: Option<bool>,
    pub edits: Vec<LineEdit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationPreview {
    pub step: usize,
    pub name: String,
    pub message: String,
}

/// What a run would do, without touching disk or the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub steps: Vec<StepPreview>,
    pub valid: bool,
    pub violations: Vec<ViolationPreview>,
}

pub fn preview_plan(plan: &Plan) -> PlanPreview {
    let layout: &InputLayout = &plan.config.layout;
    let mut previous_final = 0u64;
    let steps = plan
        .steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let tc = step.time_control(layout).and_then(|r| r.ok());
            let duration = step.final_step.saturating_sub(previous_final);
            previous_final = step.final_step;
            StepPreview {
                number: idx + 1,
                name: step.name.clone(),
                description: step.description.clone(),
                final_step: step.final_step,
                kstart: tc.map(|t| t.kstart),
                kstep: tc.map(|t| t.kstep),
                duration,
                reads_initial_condition: step.reads_initial_condition(layout),
                edits: step
                    .params
                    .iter()
                    .map(|(line, value)| LineEdit {
                        line: *line,
                        value: value.clone(),
                    })
                    .collect(),
            }
        })
        .collect();

    let violations: Vec<ViolationPreview> = match validate_steps(&plan.steps, layout) {
        Ok(()) => Vec::new(),
        Err(found) => found
            .into_iter()
            .map(|v| ViolationPreview {
                step: v.step_index + 1,
                name: v.step_name,
                message: v.message,
            })
            .collect(),
    };
    PlanPreview {
        steps,
        valid: violations.is_empty(),
        violations,
    }
}

fn rule() -> String {
    "=".repeat(80)
}

pub fn render_text(preview: &PlanPreview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", rule());
    let _ = writeln!(out, "SEQUENTIAL STEPS PREVIEW");
    let _ = writeln!(out, "{}", rule());
    let _ = writeln!(out, "\nTotal steps configured: {}", preview.steps.len());

    for step in &preview.steps {
        let _ = writeln!(out, "\n{}", rule());
        let _ = writeln!(out, "STEP {}: {}", step.number, step.name);
        let _ = writeln!(out, "{}", rule());
        if !step.description.is_empty() {
            let _ = writeln!(out, "Description: {}", step.description);
        }
        let _ = writeln!(out, "Final step:  {}", step.final_step);
        if let (Some(kstart), Some(kstep)) = (step.kstart, step.kstep) {
            let _ = writeln!(out, "kstart:      {}", kstart);
            let _ = writeln!(out, "kstep:       {}", kstep);
        }
        if let Some(reads) = step.reads_initial_condition {
            let source = if reads { "previous state" } else { "fresh" };
            let _ = writeln!(out, "Start from:  {}", source);
        }
        let _ = writeln!(out, "\nParameters to modify:");
        for edit in &step.edits {
            let _ = writeln!(out, "  Line {:>2}: {}", edit.line, edit.value);
        }
        let _ = writeln!(out, "\nDuration: {} steps", step.duration);
    }

    let _ = writeln!(out, "\n{}", rule());
    let _ = writeln!(out, "VALIDATION CHECKS");
    let _ = writeln!(out, "{}", rule());
    if preview.valid {
        let _ = writeln!(out, "All checks passed");
    } else {
        let _ = writeln!(out, "Found {} error(s):", preview.violations.len());
        for v in &preview.violations {
            let _ = writeln!(out, "  step {} ({}): {}", v.step, v.name, v.message);
        }
    }
    out
}
