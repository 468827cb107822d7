//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the core and the daemon MUST NOT block the runtime.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::time::sleep`, not their
//! `std` counterparts.
//!
//! Blocking calls are tolerated in non-async functions (config loading before
//! the first await, CLI parsing) and in test code.

use architectural_enforcement::{
    code_part, in_async_fn, production_files, production_lines, read_source, Violation,
};

/// Substrings that mark a blocking call, with a description
const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::net::UdpSocket", "Blocking network I/O"),
    ("std::thread::sleep", "Blocking sleep"),
    ("thread::sleep(", "Blocking sleep"),
    ("std::process::Command", "Blocking process I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::io::stdin()", "Blocking stdin"),
];

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let files = production_files();
    assert!(!files.is_empty(), "no production sources found");

    let mut violations = Vec::new();
    for path in files {
        let Some(content) = read_source(&path) else {
            continue;
        };
        let all_lines: Vec<&str> = content.lines().collect();

        for (line_number, line) in production_lines(&content) {
            let code = code_part(line);
            for (needle, kind) in BLOCKING_CALLS {
                if code.contains(*needle) && in_async_fn(&all_lines, line_number - 1) {
                    violations.push(Violation {
                        path: path.clone(),
                        line: line_number,
                        kind: *kind,
                        text: line.trim().to_string(),
                    });
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking calls found in async production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async equivalents:");
        eprintln!("  - tokio::fs::read_to_string().await");
        eprintln!("  - tokio::net::TcpListener::bind().await");
        eprintln!("  - tokio::time::sleep().await");
        eprintln!("  - tokio::task::spawn_blocking() for unavoidable blocking work");

        panic!(
            "\nFound {} blocking call(s) in async production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use architectural_enforcement::{code_part, in_async_fn};

    #[test]
    fn test_blocking_io_detection() {
        let test_code = vec![
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(in_async_fn(&test_code, 1), "Should detect async function");
        assert!(code_part(test_code[1]).contains("std::fs::"));
    }

    #[test]
    fn test_non_async_function_is_tolerated() {
        let test_code = vec![
            "pub fn load_config_from_path(path: &Path) -> Result<Config> {",
            "    let contents = std::fs::read_to_string(path)?;",
            "}",
        ];
        assert!(!in_async_fn(&test_code, 1), "Should detect non-async function");
    }

    #[test]
    fn test_commented_call_ignored() {
        let line = "    let x = 1; // std::thread::sleep(d) would block here";
        assert!(!code_part(line).contains("thread::sleep("));
    }
}
