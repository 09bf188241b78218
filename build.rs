use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's Rust sources. Anything else in the
// workspace (vendored data, scratch files) is not linted.
const SOURCE_DIRS: [&str; 6] = ["ized", "qr", "expand", "glm", "tests", "benches"];

const EDIT_LOG_WORDS: &str =
    "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One source policy: a line regex, an extra per-line filter, and the advice
/// printed when it fires.
struct Rule {
    name: &'static str,
    pattern: String,
    keep: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the offending lines of a single file for one rule.
struct LineCollector {
    file_path: PathBuf,
    keep: fn(&str) -> bool,
    violations: Vec<String>,
}

impl LineCollector {
    fn new(file_path: &Path, keep: fn(&str) -> bool) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            keep,
            violations: Vec::new(),
        }
    }

    fn error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.name,
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
        Some(msg)
    }
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.keep)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

/// Text of a line comment with its `//`, `///` or `//!` marker removed.
fn comment_body(line: &str) -> &str {
    let trimmed = line.trim_start();
    let body = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
        .unwrap_or(trimmed);
    body.trim()
}

// Underscore-prefixed names inside string literals are message text, not bindings.
fn underscore_binding_in_code(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    let quoted_underscore = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !quoted_underscore
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_uppercase_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let letters: Vec<char> = comment_body(line).chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn always(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed bindings",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            keep: underscore_binding_in_code,
            advice: "Underscore-prefixed names are not allowed. Use the value or remove it.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            keep: always,
            advice: "#[allow(dead_code)] is forbidden. Use the code or delete it.",
        },
        Rule {
            name: "edit-log comments",
            pattern: format!(r"(//|/\*).*(?:{EDIT_LOG_WORDS})"),
            keep: always,
            advice: "Comments must describe the code, not its edit history.",
        },
        Rule {
            name: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            keep: stars_outside_doc_comment,
            advice: "'**' is only allowed in doc comments.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            keep: all_uppercase_comment,
            advice: "Comments whose letters are all uppercase are not allowed.",
        },
    ]
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn check_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in rust_sources() {
            let mut collector = LineCollector::new(&path, rule.keep);
            searcher.search_path(&matcher, &path, &mut collector)?;
            if let Some(msg) = collector.error_message(&rule) {
                return Err(msg.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = check_sources() {
        // eprintln! so the message shows up in cargo's output.
        eprintln!("{e}");
        std::process::exit(1);
    }
}
