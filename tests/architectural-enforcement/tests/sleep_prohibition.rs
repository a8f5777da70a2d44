//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Library code runs on tokio runtimes, often a single-threaded
//! one per worker thread. A blocking `std::thread::sleep` stalls every task
//! on that runtime.
//!
//! **Required**: `tokio::time::sleep(..).await`

use architectural_enforcement::{production_lines, workspace_root};

#[test]
fn test_no_blocking_sleep_in_library_code() {
    let violations: Vec<String> = ["tether/core/src", "tether/cli/src"]
        .iter()
        .flat_map(|dir| production_lines(&workspace_root().join(dir), &[]))
        .filter(|(_, _, code)| code.contains("thread::sleep"))
        .map(|(path, line, code)| format!("{}:{} - {}", path.display(), line, code.trim()))
        .collect();

    assert!(
        violations.is_empty(),
        "Blocking sleep found in async code:\n{}",
        violations.join("\n")
    );
}
