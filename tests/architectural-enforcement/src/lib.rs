//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! over the workspace sources:
//! - No blocking I/O inside async code
//! - No panicking shortcuts (`unwrap`/`expect`) in production code
//!
//! The helpers here do a line-oriented scan, which is enough for the way the
//! workspace is written: unit tests sit in one `#[cfg(test)]` module at the
//! bottom of each file.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["parley/core/src", "parley/daemon/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the line is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What rule was broken
    pub kind: &'static str,
    /// The line itself, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.kind,
            self.text
        )
    }
}

/// Root of the workspace this crate lives in
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Every `.rs` file under `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Every `.rs` file of the production directories
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_files(&root.join(dir)))
        .collect()
}

/// Read a file, skipping unreadable ones
pub fn read_source(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// Index of the first line of the trailing `#[cfg(test)]` section, if any
pub fn test_section_start(lines: &[&str]) -> Option<usize> {
    lines
        .iter()
        .position(|line| line.trim_start().starts_with("#[cfg(test)]"))
}

/// The code part of a line, without a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// If `line` declares a function, whether it is async
///
/// Handles visibility and qualifiers (`pub(crate) async fn`, `const fn`).
pub fn fn_declaration(line: &str) -> Option<bool> {
    let code = code_part(line).trim();
    let words: Vec<&str> = code
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|w| !w.is_empty())
        .collect();
    let fn_pos = words.iter().position(|w| *w == "fn")?;
    let qualifiers = &words[..fn_pos];
    let allowed = |w: &&str| {
        matches!(*w, "pub" | "crate)" | "super)" | "async" | "const" | "unsafe" | "extern")
    };
    if !qualifiers.iter().all(allowed) {
        return None;
    }
    Some(qualifiers.contains(&"async"))
}

/// Whether line `idx` sits inside an async function
///
/// Scans backwards to the nearest function declaration.
pub fn in_async_fn(lines: &[&str], idx: usize) -> bool {
    lines[..=idx]
        .iter()
        .rev()
        .find_map(|line| fn_declaration(line))
        .unwrap_or(false)
}

/// Non-test lines of `content` as `(line number, line)` pairs
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let lines: Vec<&str> = content.lines().collect();
    let end = test_section_start(&lines).unwrap_or(lines.len());
    lines[..end]
        .iter()
        .enumerate()
        .map(|(idx, line)| (idx + 1, *line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_declaration() {
        assert_eq!(fn_declaration("async fn run() {"), Some(true));
        assert_eq!(fn_declaration("    pub(crate) async fn speak("), Some(true));
        assert_eq!(fn_declaration("pub fn load_config() -> Result<()> {"), Some(false));
        assert_eq!(fn_declaration("    const fn new() -> Self {"), Some(false));
        assert_eq!(fn_declaration("let f = |x| x + 1;"), None);
        assert_eq!(fn_declaration("    // fn commented()"), None);
        assert_eq!(fn_declaration("impl Fn(&str) for X"), None);
    }

    #[test]
    fn test_in_async_fn() {
        let code = vec![
            "pub async fn bad() {",
            "    let x = std::fs::read_to_string(\"f\");",
            "}",
            "pub fn fine() {",
            "    let x = std::fs::read_to_string(\"f\");",
            "}",
        ];
        assert!(in_async_fn(&code, 1));
        assert!(!in_async_fn(&code, 4));
    }

    #[test]
    fn test_production_lines_stop_at_tests() {
        let content = "fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = production_lines(content);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (1, "fn a() {}"));
    }

    #[test]
    fn test_workspace_root_contains_production_dirs() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "missing {dir}");
        }
    }
}
