//! Architectural Enforcement
//!
//! Source scanners used by this package's integration tests to keep
//! production code honest:
//! - No panicking shortcuts (`unwrap`/`expect`) outside tests
//! - No blocking sleeps on async worker threads
//! - No blocking HTTP client or subprocess I/O
//!
//! Scanning is line-based. Everything from the first `#[cfg(test)]` line of
//! a file onwards is test code and is skipped, as are comment lines.

use std::fs;
use std::path::{Path, PathBuf};

/// One forbidden pattern family
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Short name shown in reports
    pub name: &'static str,
    /// Substrings that trigger the rule
    pub patterns: &'static [&'static str],
}

/// Rules applied to production sources
pub const PRODUCTION_RULES: &[Rule] = &[
    Rule {
        name: "panicking shortcut",
        patterns: &[".unwrap()", ".expect("],
    },
    Rule {
        name: "blocking sleep",
        patterns: &["thread::sleep"],
    },
    Rule {
        name: "blocking HTTP client",
        patterns: &["reqwest::blocking"],
    },
    Rule {
        name: "blocking process I/O",
        patterns: &["std::process::Command"],
    },
];

/// A rule hit in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the hit
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Rule name
    pub rule: &'static str,
    /// Offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Workspace root, resolved from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Production lines of a source file as `(1-based line, code)` pairs
///
/// Stops at the first `#[cfg(test)]`, skips comment lines and strips
/// trailing comments.
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);
        out.push((idx + 1, code));
    }
    out
}

/// Rule hits in one file's content
pub fn scan_source(path: &Path, content: &str, rules: &[Rule]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (line, code) in production_lines(content) {
        for rule in rules {
            if rule.patterns.iter().any(|p| code.contains(p)) {
                violations.push(Violation {
                    path: path.to_path_buf(),
                    line,
                    rule: rule.name,
                    text: code.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Rule hits in every `.rs` file below `dir`
pub fn scan_directory(dir: &Path, rules: &[Rule]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        violations.extend(scan_source(path, &content, rules));
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_unwrap_in_production_code() {
        let source = "fn load() {\n    let v = read().unwrap();\n}\n";
        let hits = scan_source(Path::new("a.rs"), source, PRODUCTION_RULES);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 2);
        assert_eq!(hits[0].rule, "panicking shortcut");
    }

    #[test]
    fn test_ignores_test_module_and_comments() {
        let source = "\
/// let x = parse().unwrap();
fn ok() {} // std::thread::sleep is fine here
#[cfg(test)]
mod tests {
    fn t() { std::thread::sleep(d); x.unwrap(); }
}
";
        assert!(scan_source(Path::new("b.rs"), source, PRODUCTION_RULES).is_empty());
    }

    #[test]
    fn test_unwrap_or_variants_are_allowed() {
        let source = "fn f() { a.unwrap_or(1); b.unwrap_or_else(g); c.unwrap_or_default(); }\n";
        assert!(scan_source(Path::new("c.rs"), source, PRODUCTION_RULES).is_empty());
    }

    #[test]
    fn test_detects_blocking_sleep() {
        let source = "async fn poll() {\n    std::thread::sleep(Duration::from_millis(10));\n}\n";
        let hits = scan_source(Path::new("d.rs"), source, PRODUCTION_RULES);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule, "blocking sleep");
    }
}
