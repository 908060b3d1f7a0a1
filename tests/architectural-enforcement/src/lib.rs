//! Architectural Enforcement
//!
//! Source-scanning helpers shared by the enforcement tests in `tests/`.
//! The tests walk the production crates and fail on patterns that break the
//! conductor's async discipline:
//! - No sleep calls: wait on a channel, token or timer instead
//! - No blocking HTTP client inside the runtime
//!
//! Scanning is line based. Comments are stripped first, so prose may still
//! mention the forbidden calls.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["conductor/core/src", "conductor/daemon/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line_number: usize,
    /// The line, trimmed
    pub line: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line_number, self.line)
    }
}

/// The workspace root (two levels above this crate)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under `dir`, sorted
pub fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// The code part of a line (everything before `//`)
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Scan the production directories for lines matching `is_violation`
///
/// Directories that do not exist are skipped.
pub fn scan_production<F>(is_violation: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        if !dir.exists() {
            continue;
        }
        for path in rust_sources(&dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            violations.extend(scan_source(&path, &content, &is_violation));
        }
    }

    violations
}

/// Scan one file's contents
pub fn scan_source<F>(path: &Path, content: &str, is_violation: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| is_violation(strip_comment(line)))
        .map(|(idx, line)| Violation {
            path: path.to_path_buf(),
            line_number: idx + 1,
            line: line.trim().to_string(),
        })
        .collect()
}

/// Whether a code fragment calls a sleep function
pub fn calls_sleep(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(")
}

/// Whether a code fragment uses the blocking reqwest client
pub fn uses_blocking_client(code: &str) -> bool {
    code.contains("reqwest::blocking")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_detection() {
        let source = [
            "fn bad_function() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ]
        .join("\n");

        let violations = scan_source(Path::new("bad.rs"), &source, calls_sleep);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line_number, 2);
    }

    #[test]
    fn test_comments_are_ignored() {
        let source = "let x = 1; // never call thread::sleep(…) here\n/// or std::thread::sleep(d)";
        assert!(scan_source(Path::new("ok.rs"), source, calls_sleep).is_empty());
    }

    #[test]
    fn test_blocking_client_detection() {
        assert!(uses_blocking_client("let c = reqwest::blocking::Client::new();"));
        assert!(!uses_blocking_client("let c = reqwest::Client::new();"));
    }

    #[test]
    fn test_workspace_root_contains_production_dirs() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).exists(), "{dir} missing under {root:?}");
        }
    }
}
