//! Integration Test: Stdout Discipline
//!
//! **Policy**: A worker process exchanges frames with its supervisor over
//! stdout, so library code MUST NOT print. Logging goes through `tracing`,
//! which binaries route to stderr.
//!
//! Binaries under `src/bin` own their process and are exempt.

use architectural_enforcement::{production_lines, workspace_root};

const FORBIDDEN: &[&str] = &["println!", "print!(", "dbg!(", "std::io::stdout"];

#[test]
fn test_no_stdout_writes_in_library_code() {
    let core = workspace_root().join("tether/core/src");
    assert!(core.exists(), "core sources not found at {}", core.display());

    let violations: Vec<String> = production_lines(&core, &["bin"])
        .into_iter()
        .filter(|(_, _, code)| FORBIDDEN.iter().any(|f| code.contains(f)))
        .map(|(path, line, code)| format!("{}:{} - {}", path.display(), line, code.trim()))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Stdout writes found in library code:");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use tracing::{{debug, info, warn, error}} instead.");
        panic!(
            "\nFound {} stdout write(s) in library code.",
            violations.len()
        );
    }
}
