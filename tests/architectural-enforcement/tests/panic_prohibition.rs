//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors with `?` or handles them; it
//! never calls `.unwrap()` or `.expect("..")`. A panic inside a conversation
//! task only ends that task, but a panic on the accept loop or in a registry
//! under a lock takes down every client.

use architectural_enforcement::{code_part, production_files, production_lines, read_source, Violation};

/// Find panicking shortcuts on one code line
fn panicking_call(code: &str) -> Option<&'static str> {
    if code.contains(".unwrap()") {
        Some("unwrap() in production code")
    } else if code.contains(".expect(\"") {
        Some("expect() in production code")
    } else {
        None
    }
}

#[test]
fn test_no_unwrap_in_production_code() {
    let files = production_files();
    assert!(!files.is_empty(), "no production sources found");

    let mut violations = Vec::new();
    for path in files {
        let Some(content) = read_source(&path) else {
            continue;
        };
        for (line_number, line) in production_lines(&content) {
            if let Some(kind) = panicking_call(code_part(line)) {
                violations.push(Violation {
                    path: path.clone(),
                    line: line_number,
                    kind,
                    text: line.trim().to_string(),
                });
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!(
            "\nFound {} panicking call(s) in production code.\nPropagate the error instead.",
            violations.len()
        );
    }
}

#[test]
fn test_detection() {
    assert!(panicking_call("let x = y.unwrap();").is_some());
    assert!(panicking_call("let x = y.expect(\"present\");").is_some());
    assert!(panicking_call("let x = y.unwrap_or_default();").is_none());
    // A method that happens to be called `expect`
    assert!(panicking_call("let pending = self.acks.expect(speaker);").is_none());
}
