//! Idempotent editor for chronyd's sysconfig/default env file (§4.7's
//! chrony variant): inserts or removes the `-x` flag inside a marked block
//! so the daemon stops disciplining the system clock itself, without
//! disturbing anything else an administrator put in the file.

use std::fs;
use std::io;
use std::path::Path;

const BEGIN_MARKER: &str = "### BEGIN sfptpd ###";
const END_MARKER: &str = "### END sfptpd ###";

#[derive(thiserror::Error, Debug)]
pub enum EnvFileError {
    #[error("io error editing '{path}': {source}")]
    Io { path: String, #[source] source: io::Error },
    #[error("neither candidate env file exists: {0:?}")]
    NoCandidate(Vec<String>),
}

/// The two paths chronyd's env file is conventionally found at, tried in
/// order: Red-Hat-derived distributions use the first, Debian-derived ones
/// the second.
pub const CANDIDATE_PATHS: [&str; 2] = ["/etc/sysconfig/chronyd", "/etc/default/chrony"];

pub fn find_candidate() -> Option<&'static str> {
    CANDIDATE_PATHS.iter().copied().find(|p| Path::new(p).exists())
}

/// Rewrites `path` so the managed block sets `OPTIONS` (or `DAEMON_OPTS`
/// for the Debian variant) to the file's existing value for that key with
/// `-x` appended, replacing any previous managed block and leaving the
/// rest of the file — including the original, un-managed `KEY=` line, if
/// any — untouched. Reading the existing value back out of the stripped
/// file (rather than hard-coding `-x`) is what makes two successive
/// `enable_no_clock_control` calls converge to the same bytes (§8 S5):
/// the managed block is always derived from the file's own un-managed
/// assignment, never from a previous managed block's value.
pub fn enable_no_clock_control(path: &Path, options_var: &str) -> Result<bool, EnvFileError> {
    edit(path, |lines| {
        let stripped = strip_managed_block(lines);
        let existing = find_key_value(&stripped, options_var).unwrap_or_default();
        let new_value = if existing.is_empty() { "-x".to_string() } else { format!("{existing} -x") };

        let mut out = stripped;
        if !out.is_empty() && !out.last().unwrap().is_empty() {
            out.push(String::new());
        }
        out.push(BEGIN_MARKER.to_string());
        out.push(format!("{options_var}=\"{new_value}\""));
        out.push(END_MARKER.to_string());
        out
    })
}

/// Finds the last un-managed `KEY="value"` assignment and returns its
/// inner value. Only the double-quoted form is recognised, matching the
/// shape chronyd's own packaged env files use.
fn find_key_value(lines: &[String], key: &str) -> Option<String> {
    let prefix = format!("{key}=\"");
    lines
        .iter()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim();
            trimmed.strip_prefix(&prefix).and_then(|rest| rest.strip_suffix('"'))
        })
        .map(str::to_string)
}

/// Removes the managed block entirely, restoring the file to how it would
/// look had this daemon never touched it.
pub fn disable_no_clock_control(path: &Path) -> Result<bool, EnvFileError> {
    edit(path, strip_managed_block)
}

fn edit(path: &Path, transform: impl FnOnce(&[String]) -> Vec<String>) -> Result<bool, EnvFileError> {
    let original = fs::read_to_string(path).map_err(|e| EnvFileError::Io { path: path.display().to_string(), source: e })?;
    let lines: Vec<String> = original.lines().map(String::from).collect();
    let rewritten = transform(&lines);
    let rendered = if rewritten.is_empty() { String::new() } else { rewritten.join("\n") + "\n" };

    if rendered == original {
        return Ok(false);
    }
    fs::write(path, rendered).map_err(|e| EnvFileError::Io { path: path.display().to_string(), source: e })?;
    Ok(true)
}

fn strip_managed_block(lines: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut in_block = false;
    for line in lines {
        if line.trim() == BEGIN_MARKER {
            in_block = true;
            continue;
        }
        if line.trim() == END_MARKER {
            in_block = false;
            continue;
        }
        if !in_block {
            out.push(line.clone());
        }
    }
    while out.last().map(String::is_empty).unwrap_or(false) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn inserts_block_into_file_with_no_prior_block() {
        let f = write_tmp("OTHER_SETTING=1\n");
        let changed = enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        assert!(changed);
        let result = fs::read_to_string(f.path()).unwrap();
        assert!(result.contains("OTHER_SETTING=1"));
        assert!(result.contains(BEGIN_MARKER));
        assert!(result.contains("OPTIONS=\"-x\""));
    }

    #[test]
    fn re_enabling_is_idempotent() {
        let f = write_tmp("OTHER_SETTING=1\n");
        enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        let changed_again = enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        assert!(!changed_again);
    }

    #[test]
    fn appends_x_to_the_files_existing_options_value() {
        let f = write_tmp("OPTIONS=\"-F 1\"\n");
        enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        let result = fs::read_to_string(f.path()).unwrap();
        assert_eq!(result.matches(BEGIN_MARKER).count(), 1);
        assert!(result.contains("OPTIONS=\"-F 1 -x\""));

        let changed_again = enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        assert!(!changed_again, "second application must be a fixed point");
    }

    #[test]
    fn disable_removes_managed_block_but_keeps_other_lines() {
        let f = write_tmp("OTHER_SETTING=1\n");
        enable_no_clock_control(f.path(), "OPTIONS").unwrap();
        let changed = disable_no_clock_control(f.path()).unwrap();
        assert!(changed);
        let result = fs::read_to_string(f.path()).unwrap();
        assert_eq!(result, "OTHER_SETTING=1\n");
    }

    #[test]
    fn disable_on_file_without_block_is_a_no_op() {
        let f = write_tmp("OTHER_SETTING=1\n");
        let changed = disable_no_clock_control(f.path()).unwrap();
        assert!(!changed);
    }
}
