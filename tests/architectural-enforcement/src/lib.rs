//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - Library code never writes to stdout (it carries worker frames)
//! - No blocking sleeps in async library code
//!
//! These tests are designed to catch violations early in the development cycle.

use std::path::{Path, PathBuf};

/// Root of the workspace, resolved from this package's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Production source lines of every `.rs` file under `dir`
///
/// Comment-only text is stripped and scanning of a file stops at its
/// `#[cfg(test)]` module. Files under any `skip` directory are ignored.
#[must_use]
pub fn production_lines(dir: &Path, skip: &[&str]) -> Vec<(PathBuf, usize, String)> {
    let mut lines = Vec::new();

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
    {
        let path = entry.path();
        if skip
            .iter()
            .any(|s| path.components().any(|c| c.as_os_str() == *s))
        {
            continue;
        }

        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            if line.trim_start().starts_with("#[cfg(test)]") {
                break;
            }
            let code = line.split("//").next().unwrap_or(line);
            if !code.trim().is_empty() {
                lines.push((path.to_path_buf(), idx + 1, code.to_string()));
            }
        }
    }

    lines
}
