use crate::config::InputLayout;
use crate::error::Violation;
use crate::plan::Step;

/// Check the step chain for continuity before anything runs.
///
/// Every problem is collected so one preview surfaces the whole list.
pub fn validate_steps(steps: &[Step], layout: &InputLayout) -> Result<(), Vec<Violation>> {
    if steps.is_empty() {
        return Err(vec![Violation {
            step_index: 0,
            step_name: String::new(),
            message: "plan has no steps".to_string(),
        }]);
    }

    let mut violations = Vec::new();
    let mut report = |idx: usize, step: &Step, message: String| {
        violations.push(Violation {
            step_index: idx,
            step_name: step.name.clone(),
            message,
        });
    };

    for (idx, step) in steps.iter().enumerate() {
        match step.time_control(layout) {
            None => report(
                idx,
                step,
                format!(
                    "line{} (kstep kprint kbackup kstart) is not set",
                    layout.time_control_line
                ),
            ),
            Some(Err(msg)) => report(idx, step, msg),
            Some(Ok(tc)) => {
                if idx > 0 {
                    let prev_final = steps[idx - 1].final_step;
                    if tc.kstart != prev_final {
                        report(
                            idx,
                            step,
                            format!(
                                "kstart={} doesn't match previous final_step={}",
                                tc.kstart, prev_final
                            ),
                        );
                    }
                }
                match tc.end() {
                    None => report(
                        idx,
                        step,
                        format!("kstep({})+kstart({}) overflows", tc.kstep, tc.kstart),
                    ),
                    Some(end) if end != step.final_step => report(
                        idx,
                        step,
                        format!(
                            "kstep({})+kstart({})={} doesn't match final_step={}",
                            tc.kstep, tc.kstart, end, step.final_step
                        ),
                    ),
                    Some(_) => {}
                }
            }
        }

        if idx > 0 {
            match step.reads_initial_condition(layout) {
                Some(true) => {}
                Some(false) => report(
                    idx,
                    step,
                    format!(
                        "line{} must set the read-initial-condition flag (token {}) to 1",
                        layout.restart_line,
                        layout.restart_flag_token + 1
                    ),
                ),
                None => report(
                    idx,
                    step,
                    format!(
                        "line{} is not set; later steps must read the prior initial condition",
                        layout.restart_line
                    ),
                ),
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn step(name: &str, line8: &str, line10: Option<&str>, final_step: u64) -> Step {
        let mut params = BTreeMap::new();
        params.insert(8, line8.to_string());
        if let Some(l) = line10 {
            params.insert(10, l.to_string());
        }
        Step {
            name: name.to_string(),
            description: String::new(),
            params,
            final_step,
        }
    }

    #[test]
    fn accepts_consistent_two_step_chain() {
        let steps = vec![
            step("one", "5000 1000 1000 0", Some("1 0 0 1"), 5000),
            step("two", "2000 1000 1000 5000", Some("1 0 0 1"), 7000),
        ];
        assert_eq!(validate_steps(&steps, &InputLayout::default()), Ok(()));
    }

    #[test]
    fn mismatched_kstart_yields_exactly_one_violation() {
        let steps = vec![
            step("one", "5000 1000 1000 0", Some("1 0 0 1"), 5000),
            step("two", "3000 1000 1000 4000", Some("1 0 0 1"), 7000),
            step("three", "1000 1000 1000 7000", Some("1 0 0 1"), 8000),
        ];
        let violations = validate_steps(&steps, &InputLayout::default()).expect_err("invalid");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].step_index, 1);
        assert_eq!(violations[0].step_name, "two");
        assert!(violations[0].message.contains("kstart=4000"));
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let steps = vec![
            step("one", "5000 1000 1000 0", None, 4000),
            step("two", "2000 1000 1000 5000", Some("0 0 0 1"), 7000),
            step("three", "2000 1000 1000 7000", None, 9000),
        ];
        let violations = validate_steps(&steps, &InputLayout::default()).expect_err("invalid");
        let steps_hit: Vec<usize> = violations.iter().map(|v| v.step_index).collect();
        // one: bad final_step; two: kstart vs 4000, flag off; three: restart line missing
        assert_eq!(steps_hit, vec![0, 1, 1, 2]);
    }

    #[test]
    fn missing_or_garbled_time_line_is_reported() {
        let mut missing = step("one", "5000 1000 1000 0", None, 5000);
        missing.params.remove(&8);
        let garbled = step("two", "a b c d", Some("1"), 7000);
        let violations =
            validate_steps(&[missing, garbled], &InputLayout::default()).expect_err("invalid");
        assert_eq!(violations.len(), 2);
        assert!(violations[0].message.contains("line8"));
        assert!(violations[1].message.contains("kstep"));
    }

    #[test]
    fn overflowing_time_line_is_a_violation() {
        let huge = format!("{} 1 1 1", u64::MAX);
        let steps = vec![
            step("one", &huge, None, 5000),
            step("two", "2000 1000 1000 5000", Some("1 0 0 1"), 7000),
        ];
        let violations = validate_steps(&steps, &InputLayout::default()).expect_err("invalid");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].step_index, 0);
        assert!(violations[0].message.contains("overflows"), "{}", violations[0].message);
    }

    #[test]
    fn does_not_mutate_input() {
        let steps = vec![step("one", "5000 1000 1000 0 ! note", None, 5000)];
        let before = steps.clone();
        let _ = validate_steps(&steps, &InputLayout::default());
        assert_eq!(steps, before);
    }
}
