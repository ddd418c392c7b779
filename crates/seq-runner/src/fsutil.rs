use chrono::Utc;
use globset::GlobSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, RunError};

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| RunError::io(path, e))
}

/// Replace `path` with `bytes` via a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        // keep the mode of the file being replaced (scripts stay executable)
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(RunError::io(path, e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| RunError::io(path, std::io::Error::other(e)))?;
    atomic_write_bytes(path, &bytes)
}

/// Recursively copy `src` into `dst`. Entries whose file name matches
/// `exclude` are skipped unless listed in `keep`. `fs::copy` carries the
/// permission bits across.
pub(crate) fn copy_dir_filtered(
    src: &Path,
    dst: &Path,
    exclude: &GlobSet,
    keep: &[&str],
) -> Result<usize> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            keep.iter().any(|k| *k == name) || !exclude.is_match(name.as_ref())
        });
    let mut copied = 0;
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            RunError::io(path, std::io::Error::other(e))
        })?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target).map_err(|e| RunError::io(path, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
pub(crate) fn temp_root(tag: &str) -> std::path::PathBuf {
    let root = std::env::temp_dir().join(format!(
        "seqrun_{}_test_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&root).expect("temp root");
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use globset::{Glob, GlobSetBuilder};

    fn globs(patterns: &[&str]) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            builder.add(Glob::new(p).expect("glob"));
        }
        builder.build().expect("globset")
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let root = temp_root("atomic");
        let path = root.join("inputN.in");
        atomic_write_bytes(&path, b"first\n").expect("first write");
        atomic_write_bytes(&path, b"second\n").expect("second write");
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
        let leftovers: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn copy_skips_excluded_names_but_honors_keep_list() {
        let root = temp_root("copy");
        let src = root.join("origin");
        ensure_dir(&src.join("sub")).unwrap();
        fs::write(src.join("inputN.in"), "x").unwrap();
        fs::write(src.join("PELOOP.00005000.dat"), "x").unwrap();
        fs::write(src.join("slurm-42.out"), "x").unwrap();
        fs::write(src.join("sub").join("notes.txt"), "x").unwrap();
        fs::write(src.join("pxyz.in"), "x").unwrap();
        let dst = root.join("work");

        let copied = copy_dir_filtered(
            &src,
            &dst,
            &globs(&["*.dat", "slurm-*", "*.in"]),
            &["pxyz.in"],
        )
        .expect("copy");

        assert_eq!(copied, 2);
        assert!(dst.join("sub").join("notes.txt").is_file());
        assert!(dst.join("pxyz.in").is_file());
        assert!(!dst.join("inputN.in").exists());
        assert!(!dst.join("PELOOP.00005000.dat").exists());
        assert!(!dst.join("slurm-42.out").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let root = temp_root("perm");
        let src = root.join("origin");
        ensure_dir(&src).unwrap();
        let script = src.join("V-3.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let dst = root.join("work");
        copy_dir_filtered(&src, &dst, &globs(&[]), &[]).expect("copy");
        let mode = fs::metadata(dst.join("V-3.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let _ = fs::remove_dir_all(root);
    }
}
