//! Embeds the git revision and enforces source-tree rules.
//!
//! Rules (the build fails on any violation):
//! - no checked file exceeds `MAX_LINES` non-empty lines
//! - no `#[allow(dead_code)]`
//! - tests never skip themselves (skip messages, conditional bare `return;`)
//! - no thread that builds its own tokio runtime
//! - tests that mutate environment variables are `#[serial]`

use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "node_modules", "examples"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

const SKIP_PATTERNS: &[&str] = &[
    "Skipping test",
    "skipping test",
    "Test skipped",
    "test skipped",
    "daemon not available",
    "hub not reachable, skipping",
];

struct Source {
    path: PathBuf,
    lines: Vec<String>,
}

struct Violation {
    rule: &'static str,
    location: String,
    detail: String,
}

struct TestFn<'a> {
    name: String,
    line: usize,
    serial: bool,
    /// Body lines with the brace depth after each line.
    body: Vec<(&'a str, i32)>,
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");
    println!("cargo:rustc-env=LOGHUB_GIT_SHA={}", git_sha());

    let root = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set"),
    );
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    let sources: Vec<Source> = files
        .iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .filter_map(|p| {
            let content = std::fs::read_to_string(p).ok()?;
            Some(Source {
                path: p.strip_prefix(&root).unwrap_or(p).to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            })
        })
        .collect();

    let mut violations = check_line_limits(&root, &files);
    for source in &sources {
        violations.extend(check_dead_code_allows(source));
        violations.extend(check_nested_runtimes(source));
        violations.extend(check_tests(source));
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("SOURCE RULE VIOLATIONS");
        eprintln!("========================================");
        for v in &violations {
            eprintln!("  [{}] {}", v.rule, v.location);
            eprintln!("    {}", v.detail);
        }
        eprintln!("========================================\n");
        panic!("Build failed: {} source rule violation(s)", violations.len());
    }
}

fn git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let tracked = Command::new("git")
        .args(["ls-files"])
        .current_dir(root)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok());

    match tracked {
        Some(stdout) => stdout
            .lines()
            .map(|line| root.join(line))
            .filter(|path| should_check_file(path, root))
            .collect(),
        None => {
            let mut files = Vec::new();
            walk_directory(root, root, &mut files);
            files
        }
    }
}

fn walk_directory(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            let excluded = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| EXCLUDED_DIRS.contains(&name));
            if !excluded {
                walk_directory(&path, root, files);
            }
        } else if should_check_file(&path, root) {
            files.push(path);
        }
    }
}

fn should_check_file(path: &Path, root: &Path) -> bool {
    let checked_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext));
    if !checked_ext {
        return false;
    }
    let Ok(rel_path) = path.strip_prefix(root) else {
        return true;
    };
    let rel_str = rel_path.to_string_lossy();
    if EXCLUDED_FILES.iter().any(|excluded| rel_str == *excluded) {
        return false;
    }
    !rel_path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(|name| EXCLUDED_DIRS.contains(&name))
}

fn check_line_limits(root: &Path, files: &[PathBuf]) -> Vec<Violation> {
    files
        .iter()
        .filter_map(|file| {
            let content = std::fs::read_to_string(file).ok()?;
            let count = content.lines().filter(|l| !l.trim().is_empty()).count();
            (count > MAX_LINES).then(|| Violation {
                rule: "line-limit",
                location: file.strip_prefix(root).unwrap_or(file).display().to_string(),
                detail: format!(
                    "{} lines (max {}); split the file into smaller modules",
                    count, MAX_LINES
                ),
            })
        })
        .collect()
}

fn check_dead_code_allows(source: &Source) -> Vec<Violation> {
    source
        .lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
        })
        .map(|(i, line)| Violation {
            rule: "dead-code",
            location: format!("{}:{}", source.path.display(), i + 1),
            detail: format!("{} (delete unused code instead)", line.trim()),
        })
        .collect()
}

/// tarpc clients created inside a nested runtime die with that runtime.
fn check_nested_runtimes(source: &Source) -> Vec<Violation> {
    let lines = &source.lines;
    (0..lines.len())
        .filter(|&i| {
            let trimmed = lines[i].trim();
            trimmed.contains("thread::spawn(") && !trimmed.starts_with("//")
        })
        .filter(|&i| {
            lines[i..(i + 20).min(lines.len())].iter().any(|l| {
                l.contains("Runtime::new()") || l.contains("runtime::Builder")
            })
        })
        .map(|i| Violation {
            rule: "nested-runtime",
            location: format!("{}:{}", source.path.display(), i + 1),
            detail: "thread builds its own runtime; use async functions instead".to_string(),
        })
        .collect()
}

fn check_tests(source: &Source) -> Vec<Violation> {
    let mut violations = Vec::new();
    for test in test_functions(&source.lines) {
        let location = format!("{}:{}", source.path.display(), test.line);

        let skips = test.body.iter().any(|(line, depth)| {
            SKIP_PATTERNS.iter().any(|p| line.contains(p)) || (line.trim() == "return;" && *depth > 1)
        });
        if skips {
            violations.push(Violation {
                rule: "test-skip",
                location: location.clone(),
                detail: format!("test `{}` skips itself; make it fail instead", test.name),
            });
        }

        let mutates_env = test.body.iter().any(|(line, _)| {
            let trimmed = line.trim();
            !trimmed.starts_with("//")
                && (trimmed.contains("env::set_var") || trimmed.contains("env::remove_var"))
        });
        if mutates_env && !test.serial {
            violations.push(Violation {
                rule: "serial-env",
                location,
                detail: format!("test `{}` mutates env without #[serial]", test.name),
            });
        }
    }
    violations
}

fn is_serial_attr(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == "#[serial]" || trimmed == "#[serial_test::serial]"
}

fn test_functions(lines: &[String]) -> Vec<TestFn<'_>> {
    let mut tests = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            i += 1;
            continue;
        }

        let mut serial = lines[..i]
            .iter()
            .rev()
            .take_while(|l| l.trim().starts_with("#["))
            .any(|l| is_serial_attr(l));
        let mut j = i + 1;
        while j < lines.len() && !lines[j].contains("fn ") {
            serial |= is_serial_attr(&lines[j]);
            j += 1;
        }
        let Some(signature) = lines.get(j) else {
            break;
        };
        let name = signature
            .split("fn ")
            .nth(1)
            .and_then(|rest| rest.split('(').next())
            .map(|n| n.trim().to_string())
            .unwrap_or_default();

        let mut depth = 0i32;
        let mut opened = false;
        let mut body = Vec::new();
        let mut k = j;
        while k < lines.len() {
            for c in lines[k].chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            body.push((lines[k].as_str(), depth));
            if opened && depth <= 0 {
                break;
            }
            k += 1;
        }

        tests.push(TestFn {
            name,
            line: i + 1,
            serial,
            body,
        });
        i = k + 1;
    }
    tests
}
