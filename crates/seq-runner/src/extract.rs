use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::ChunkPattern;
use crate::error::{Result, RunError};

/// Final per-point state: three components on an `nx * ny * nz` grid, stored
/// `i`-major with `k` varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    dims: (usize, usize, usize),
    values: Vec<[f64; 3]>,
}

impl StateRecord {
    pub fn new(dims: (usize, usize, usize), values: Vec<[f64; 3]>) -> Option<Self> {
        (dims.0 * dims.1 * dims.2 == values.len()).then_some(Self { dims, values })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 0-based grid lookup.
    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<[f64; 3]> {
        let (nx, ny, nz) = self.dims;
        if i >= nx || j >= ny || k >= nz {
            return None;
        }
        Some(self.values[offset(self.dims, i, j, k)])
    }

    pub fn values(&self) -> &[[f64; 3]] {
        &self.values
    }
}

fn offset((_, ny, nz): (usize, usize, usize), i: usize, j: usize, k: usize) -> usize {
    (i * ny + j) * nz + k
}

/// Shortest possible record line: `1 1 1 0 0 0\n`.
const MIN_RECORD_BYTES: u64 = 12;

/// Output file names for a step: chunk `c` is the pattern rendered with
/// `final_step + c`.
pub fn chunk_file_names(
    pattern: &ChunkPattern,
    num_chunks: usize,
    final_step: u64,
) -> Result<Vec<String>> {
    (0..num_chunks as u64)
        .map(|c| {
            final_step.checked_add(c).map(|n| pattern.render(n)).ok_or_else(|| {
                RunError::Plan(format!(
                    "output index final_step {} + chunk {} overflows",
                    final_step, c
                ))
            })
        })
        .collect()
}

/// Assemble the state at `final_step` from all chunk files in `dir`.
///
/// Each chunk starts with an `nx ny nz` header followed by `i j k px py pz`
/// records (1-based indices). Short lines are skipped and the last record for
/// a point wins. Any missing chunk, bad record, or grid point left unwritten is
/// an error: a partial state is never handed to the next step.
pub fn extract_final_state(
    dir: &Path,
    pattern: &ChunkPattern,
    num_chunks: usize,
    final_step: u64,
) -> Result<StateRecord> {
    info!(final_step, chunks = num_chunks, "extracting final state");
    let mut paths = Vec::with_capacity(num_chunks);
    let mut total_bytes = 0u64;
    for name in chunk_file_names(pattern, num_chunks, final_step)? {
        let path = dir.join(&name);
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(RunError::extraction(&path, "missing data file")),
        };
        total_bytes = total_bytes.saturating_add(meta.len());
        paths.push(path);
    }
    // every grid point needs one record line, so the files bound the grid
    let max_points = usize::try_from(total_bytes / MIN_RECORD_BYTES).unwrap_or(usize::MAX);

    let mut dims: Option<(usize, usize, usize)> = None;
    let mut values: Vec<[f64; 3]> = Vec::new();
    let mut written: Vec<bool> = Vec::new();

    for path in paths {
        let data = fs::read_to_string(&path).map_err(|e| RunError::io(&path, e))?;
        let mut lines = data.lines();
        let header = parse_header(lines.next().unwrap_or(""))
            .ok_or_else(|| RunError::extraction(&path, "bad header, expected `nx ny nz`"))?;
        match dims {
            None => {
                info!(nx = header.0, ny = header.1, nz = header.2, "grid dimensions");
                let n = header
                    .0
                    .checked_mul(header.1)
                    .and_then(|n| n.checked_mul(header.2))
                    .ok_or_else(|| RunError::extraction(&path, "grid dimensions overflow"))?;
                if n > max_points {
                    return Err(RunError::extraction(
                        &path,
                        format!(
                            "header declares {} grid points but the chunk files can hold at most {} records",
                            n, max_points
                        ),
                    ));
                }
                values = vec![[0.0; 3]; n];
                written = vec![false; n];
                dims = Some(header);
            }
            Some(d) if d != header => {
                return Err(RunError::extraction(
                    &path,
                    format!(
                        "grid {}x{}x{} differs from first chunk {}x{}x{}",
                        header.0, header.1, header.2, d.0, d.1, d.2
                    ),
                ));
            }
            Some(_) => {}
        }

        for (line_no, line) in lines.enumerate() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }
            let bad = |what: &str| {
                RunError::extraction(&path, format!("line {}: {}: {}", line_no + 2, what, line.trim()))
            };
            let mut idx = [0usize; 3];
            for (slot, token) in idx.iter_mut().zip(&parts[..3]) {
                *slot = token.parse::<usize>().map_err(|_| bad("bad grid index"))?;
            }
            let mut v = [0f64; 3];
            for (slot, token) in v.iter_mut().zip(&parts[3..6]) {
                *slot = token.parse::<f64>().map_err(|_| bad("bad value"))?;
            }
            let (nx, ny, nz) = header;
            let [i, j, k] = idx;
            if i == 0 || j == 0 || k == 0 || i > nx || j > ny || k > nz {
                return Err(bad("grid index outside header dimensions"));
            }
            let at = offset(header, i - 1, j - 1, k - 1);
            values[at] = v;
            written[at] = true;
        }
    }

    let dims = dims.ok_or_else(|| RunError::extraction(dir, "no chunk files configured"))?;
    let missing = written.iter().filter(|w| !**w).count();
    if missing > 0 {
        return Err(RunError::extraction(
            dir,
            format!("{} of {} grid points have no record", missing, written.len()),
        ));
    }
    StateRecord::new(dims, values)
        .ok_or_else(|| RunError::extraction(dir, "record count does not match grid"))
}

fn parse_header(line: &str) -> Option<(usize, usize, usize)> {
    let mut tokens = line.split_whitespace().map(|t| t.parse::<usize>().ok());
    let nx = tokens.next()??;
    let ny = tokens.next()??;
    let nz = tokens.next()??;
    (nx > 0 && ny > 0 && nz > 0).then_some((nx, ny, nz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::temp_root;

    /// 2x2x2 grid split into two chunks along i.
    fn write_chunks(dir: &Path, final_step: u64) {
        let pattern = ChunkPattern::default();
        for chunk in 0..2u64 {
            let mut body = String::from("2 2 2\n");
            let i = chunk + 1;
            for j in 1..=2 {
                for k in 1..=2 {
                    // an early record that must be replaced by the later one
                    body.push_str(&format!("{} {} {} 9 9 9\n", i, j, k));
                }
            }
            body.push_str("# separator\n");
            for j in 1..=2 {
                for k in 1..=2 {
                    let v = (i * 100 + j * 10 + k) as f64;
                    body.push_str(&format!("{} {} {} {} {} {}\n", i, j, k, v, -v, v / 10.0));
                }
            }
            fs::write(dir.join(pattern.render(final_step + chunk)), body).unwrap();
        }
    }

    #[test]
    fn assembles_last_records_from_all_chunks_in_order() {
        let root = temp_root("extract_ok");
        write_chunks(&root, 5000);
        let state = extract_final_state(&root, &ChunkPattern::default(), 2, 5000).expect("state");
        assert_eq!(state.dims(), (2, 2, 2));
        assert_eq!(state.len(), 8);
        assert_eq!(state.get(0, 0, 0), Some([111.0, -111.0, 11.1]));
        assert_eq!(state.get(1, 1, 1), Some([222.0, -222.0, 22.2]));
        assert_eq!(state.values()[1], [112.0, -112.0, 11.2]);
        assert_eq!(state.get(2, 0, 0), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_chunk_is_fatal() {
        let root = temp_root("extract_missing");
        write_chunks(&root, 5000);
        let err = extract_final_state(&root, &ChunkPattern::default(), 3, 5000).expect_err("missing");
        assert!(err.to_string().contains("PELOOP.00005002.dat"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_record_and_header_are_fatal() {
        let root = temp_root("extract_bad");
        let pattern = ChunkPattern::default();
        fs::write(root.join(pattern.render(10)), "1 1 1\n1 1 1 0.5 abc 0.1\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 10).expect_err("bad value");
        assert!(matches!(err, RunError::Extraction { .. }));

        fs::write(root.join(pattern.render(20)), "garbage\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 20).expect_err("bad header");
        assert!(err.to_string().contains("bad header"), "{}", err);

        fs::write(root.join(pattern.render(30)), "1 1 1\n2 1 1 0 0 0\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 30).expect_err("out of grid");
        assert!(err.to_string().contains("outside"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn oversized_or_overflowing_header_is_an_extraction_error() {
        let root = temp_root("extract_huge");
        let pattern = ChunkPattern::default();
        fs::write(root.join(pattern.render(0)), "4294967296 4294967296 2\n1 1 1 0 0 0\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 0).expect_err("overflow");
        assert!(matches!(err, RunError::Extraction { .. }));
        assert!(err.to_string().contains("overflow"), "{}", err);

        fs::write(root.join(pattern.render(1)), "100000 100000 100000\n1 1 1 0 0 0\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 1).expect_err("too large");
        assert!(err.to_string().contains("at most"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn chunk_names_reject_index_overflow() {
        let pattern = ChunkPattern::default();
        let names = chunk_file_names(&pattern, 2, 7000).expect("names");
        assert_eq!(names, vec!["PELOOP.00007000.dat", "PELOOP.00007001.dat"]);
        assert!(chunk_file_names(&pattern, 2, u64::MAX).is_err());
        assert!(chunk_file_names(&pattern, 1, u64::MAX).is_ok());
    }

    #[test]
    fn unwritten_points_and_dimension_mismatch_are_fatal() {
        let root = temp_root("extract_partial");
        let pattern = ChunkPattern::default();
        fs::write(root.join(pattern.render(0)), "1 1 2\n1 1 1 0.000 0.000 0.000\n").unwrap();
        let err = extract_final_state(&root, &pattern, 1, 0).expect_err("partial");
        assert!(err.to_string().contains("1 of 2"), "{}", err);

        fs::write(root.join(pattern.render(1)), "2 1 2\n").unwrap();
        let err = extract_final_state(&root, &pattern, 2, 0).expect_err("mismatch");
        assert!(err.to_string().contains("differs"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
