//! File reads, directory exploration, and per-process binary path lookup
//! offered to the host for target inspection.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use log::warn;
use serde_json::json;

use crate::platform;

/// Read a whole file. The error carries the path and OS cause so the ABI can
/// hand the host a ready-to-display message.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("could not read file {}", path.display()))
}

/// Recursive directory listing, one entry per line:
/// `dir:<name>` or `file:<name>,<size>,<mtime>`, indented two spaces per
/// level. Entries deeper than `max_depth` are not visited; `.` and `..`
/// never appear.
pub fn explore_directory(path: &Path, max_depth: i32) -> String {
    let mut out = String::new();
    explore_recursive(path, 0, max_depth, &mut out);
    out
}

fn explore_recursive(path: &Path, depth: i32, max_depth: i32, out: &mut String) {
    if depth > max_depth {
        return;
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            let indent = "  ".repeat(depth as usize);
            let _ = writeln!(
                out,
                "{indent}Error: Failed to open directory {}. Error: {err}",
                path.display()
            );
            return;
        }
    };

    let indent = "  ".repeat(depth as usize);
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let _ = writeln!(out, "{indent}dir:{name}");
            explore_recursive(&entry.path(), depth + 1, max_depth, out);
        } else {
            let (size, mtime) = match entry.metadata() {
                Ok(meta) => (meta.len(), unix_mtime(&meta)),
                Err(_) => (0, 0),
            };
            let _ = writeln!(out, "{indent}file:{name},{size},{mtime}");
        }
    }
}

fn unix_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Resolve the target's binary path and wrap it as `{"BinaryPath": …}`.
/// On failure the returned string is a plain error message, matching what
/// the host displays verbatim.
pub fn application_info(pid: i32) -> String {
    match platform::binary_path(pid) {
        Ok(path) => json!({ "BinaryPath": path }).to_string(),
        Err(err) => {
            warn!("[memagent] binary path lookup failed for pid {pid}: {err:#}");
            format!("Error: Failed to retrieve binary path for PID {pid}. Error: {err}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn read_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\x01binary\xff").unwrap();
        let data = read_file(file.path()).unwrap();
        assert_eq!(data, b"\x00\x01binary\xff");
    }

    #[test]
    fn read_file_missing_reports_path() {
        let err = read_file(Path::new("/nonexistent/memagent-test")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/memagent-test"));
    }

    #[test]
    fn listing_has_depth_indent_and_no_dot_entries() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub/inner.bin"))
            .unwrap()
            .write_all(b"abcd")
            .unwrap();
        File::create(dir.path().join("top.txt")).unwrap();

        let listing = explore_directory(dir.path(), 3);
        assert!(listing.contains("dir:sub\n"));
        assert!(listing.contains("  file:inner.bin,4,"));
        assert!(listing.contains("file:top.txt,0,"));
        assert!(!listing.contains("dir:.\n"));
        assert!(!listing.contains("dir:..\n"));
    }

    #[test]
    fn listing_respects_max_depth() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        File::create(dir.path().join("a/b/deep.txt")).unwrap();

        let listing = explore_directory(dir.path(), 1);
        assert!(listing.contains("dir:a\n"));
        assert!(listing.contains("  dir:b\n"));
        assert!(!listing.contains("deep.txt"));
    }

    #[test]
    fn own_application_info_is_json_with_binary_path() {
        let info = application_info(platform::current_pid());
        let value: serde_json::Value = serde_json::from_str(&info).unwrap();
        let path = value["BinaryPath"].as_str().unwrap();
        assert!(!path.is_empty());
    }

    #[test]
    fn bogus_pid_yields_error_text() {
        let info = application_info(-1);
        assert!(info.starts_with("Error:"));
    }
}
