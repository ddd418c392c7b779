use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::extract::StateRecord;
use crate::fsutil::atomic_write_bytes;

/// `1.00000e+00` style: five fractional digits, signed exponent of at least
/// two digits. This is the layout the simulation's reader expects.
pub fn format_sci(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let raw = format!("{:.5e}", value);
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exp.abs())
}

pub fn render_initial_condition(state: &StateRecord) -> String {
    let (nx, ny, nz) = state.dims();
    let mut out = String::with_capacity(16 + state.len() * 48);
    let _ = writeln!(out, "{} {} {}", nx, ny, nz);
    let mut values = state.values().iter();
    for i in 1..=nx {
        for j in 1..=ny {
            for k in 1..=nz {
                if let Some([px, py, pz]) = values.next() {
                    let _ = writeln!(
                        out,
                        "{} {} {} {} {} {}",
                        i,
                        j,
                        k,
                        format_sci(*px),
                        format_sci(*py),
                        format_sci(*pz)
                    );
                }
            }
        }
    }
    out
}

/// Overwrite the initial-condition file with `state` (atomic replace).
pub fn write_initial_condition(path: &Path, state: &StateRecord) -> Result<()> {
    atomic_write_bytes(path, render_initial_condition(state).as_bytes())?;
    info!(path = %path.display(), points = state.len(), "initial condition written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::temp_root;
    use std::fs;

    #[test]
    fn formats_like_printf_e() {
        assert_eq!(format_sci(1.0), "1.00000e+00");
        assert_eq!(format_sci(0.0), "0.00000e+00");
        assert_eq!(format_sci(-0.0025), "-2.50000e-03");
        assert_eq!(format_sci(123456.0), "1.23456e+05");
        assert_eq!(format_sci(1.5e-120), "1.50000e-120");
        assert_eq!(format_sci(f64::NAN), "nan");
    }

    #[test]
    fn renders_header_then_points_in_grid_order() {
        let state = StateRecord::new(
            (1, 1, 2),
            vec![[1.0, 0.0, -1.0], [0.5, 0.25, 0.125]],
        )
        .expect("state");
        assert_eq!(
            render_initial_condition(&state),
            "1 1 2\n\
             1 1 1 1.00000e+00 0.00000e+00 -1.00000e+00\n\
             1 1 2 5.00000e-01 2.50000e-01 1.25000e-01\n"
        );
    }

    #[test]
    fn write_replaces_prior_file() {
        let root = temp_root("ic_write");
        let path = root.join("pxyz.in");
        fs::write(&path, "old contents\n").unwrap();
        let state = StateRecord::new((1, 1, 1), vec![[2.0, 3.0, 4.0]]).unwrap();
        write_initial_condition(&path, &state).expect("write");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "1 1 1\n1 1 1 2.00000e+00 3.00000e+00 4.00000e+00\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
