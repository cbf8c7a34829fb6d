//! Integration Test: Production Code Rules
//!
//! Production sources of the core library and the daemon must not panic on
//! recoverable errors or block the async runtime. Test modules are exempt.

use architectural_enforcement::{scan_directory, workspace_root, Violation, PRODUCTION_RULES};

fn scan(relative: &str) -> Vec<Violation> {
    let dir = workspace_root().join(relative);
    assert!(dir.is_dir(), "missing source directory: {}", dir.display());
    scan_directory(&dir, PRODUCTION_RULES)
}

fn report(violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\nForbidden patterns found in production code:\n");
    for violation in violations {
        eprintln!("  {violation}");
    }
    eprintln!("\nPropagate errors with `?` and use tokio::time instead of blocking sleeps.");
    panic!("found {} violation(s)", violations.len());
}

#[test]
fn test_core_production_code_is_clean() {
    report(&scan("conductor/core/src"));
}

#[test]
fn test_daemon_production_code_is_clean() {
    report(&scan("conductor/daemon/src"));
}
