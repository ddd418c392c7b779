use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, RunError};
use crate::fsutil::atomic_write_bytes;

/// Rewrite the 1-indexed lines named in `edits`, leaving every other line
/// byte-identical. An annotation (text from `marker` on) already present on a
/// rewritten line is carried over unless the new body brings its own.
pub fn apply_edits(content: &str, edits: &BTreeMap<usize, String>, marker: &str) -> Result<String> {
    let mut lines: Vec<&str> = content.split_inclusive('\n').collect();
    let out_of_range: Vec<String> = edits
        .keys()
        .filter(|n| **n == 0 || **n > lines.len())
        .map(|n| n.to_string())
        .collect();
    if !out_of_range.is_empty() {
        return Err(RunError::Plan(format!(
            "input file has {} lines, cannot edit line(s) {}",
            lines.len(),
            out_of_range.join(", ")
        )));
    }

    let mut rewritten: BTreeMap<usize, String> = BTreeMap::new();
    for (line_no, body) in edits {
        let body = body.trim_end_matches(['\r', '\n']);
        if body.contains(['\r', '\n']) {
            return Err(RunError::Plan(format!(
                "replacement for line {} spans several lines",
                line_no
            )));
        }
        let old = lines[line_no - 1];
        let (old_text, ending) = split_ending(old);
        let new_text = match old_text.find(marker) {
            Some(pos) if !body.contains(marker) => {
                format!("{} {}", body.trim_end(), &old_text[pos..])
            }
            _ => body.to_string(),
        };
        rewritten.insert(*line_no, format!("{}{}", new_text, ending));
    }
    for (line_no, text) in &rewritten {
        lines[line_no - 1] = text.as_str();
    }
    Ok(lines.concat())
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(text) = line.strip_suffix("\r\n") {
        (text, "\r\n")
    } else if let Some(text) = line.strip_suffix('\n') {
        (text, "\n")
    } else {
        (line, "")
    }
}

/// Apply `edits` to the input file in place (atomic replace).
pub fn inject_params(path: &Path, edits: &BTreeMap<usize, String>, marker: &str) -> Result<()> {
    info!(path = %path.display(), lines = edits.len(), "injecting parameters");
    let content = fs::read_to_string(path).map_err(|e| RunError::io(path, e))?;
    let updated = apply_edits(&content, edits, marker)?;
    for (line_no, body) in edits {
        debug!(line = line_no, body = %body, "line rewritten");
    }
    atomic_write_bytes(path, updated.as_bytes())
}
