use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own sources. Anything else in the checkout
// (reference material, build output) is never scanned.
const SOURCE_DIRS: [&str; 5] = ["join", "shared", "src", "tests", "benches"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenWord => {
                r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::AllCapsComment => r"(//|/\*|///).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn applies_to_build_script(self) -> bool {
        self == Rule::UnderscorePrefix
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   \
                 Either use the variable (removing the underscore) or remove it completely."
            }
            Rule::ForbiddenWord => {
                "Comments narrating edits ('FIXED', 'CHANGED', 'UPDATED' and the like) are \
                 STRICTLY FORBIDDEN in this project.\n   Remove them completely rather than \
                 commenting them out."
            }
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
            }
            Rule::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN \
                 in this project.\n   Centered section titles inside a banner are the only exception."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   \
                 Either use the code (removing the attribute) or remove it completely."
            }
        }
    }
}

// Collects the offending lines of one file for one rule.
struct Violations {
    rule: Rule,
    file_path: PathBuf,
    lines: Vec<String>,
}

impl Violations {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            lines: Vec::new(),
        }
    }

    fn is_violation(&self, line_text: &str) -> bool {
        match self.rule {
            Rule::UnderscorePrefix => !is_comment(line_text) && !underscore_only_in_string(line_text),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line_text),
            Rule::AllCapsComment => comment_text(line_text).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some()
                    && letters.all(char::is_uppercase)
                    && !is_banner_title(line_text)
            }),
        }
    }

    fn into_error_message(self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} violation(s) in {}:\n",
            self.lines.len(),
            self.file_path.display()
        );
        for line in &self.lines {
            message.push_str(&format!("   {line}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.explanation()));
        Some(message)
    }
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.is_violation(line_text) {
            self.lines.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

// A match is skipped when an underscore word only appears between quotes.
fn underscore_only_in_string(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(match rest.find("*/") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    })
}

// Titles centered inside a `// ====` banner are indented far past the comment marker.
fn is_banner_title(line: &str) -> bool {
    line.strip_prefix("//")
        .is_some_and(|rest| rest.len() - rest.trim_start().len() >= 8)
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    let mut files: Vec<PathBuf> = vec![PathBuf::from("build.rs")];
    for dir in SOURCE_DIRS {
        files.extend(
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path()),
        );
    }
    files.into_iter()
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in source_files() {
        if path == Path::new("build.rs") && !rule.applies_to_build_script() {
            continue;
        }
        if std::fs::metadata(&path).is_err() {
            continue;
        }
        let mut violations = Violations::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut violations)?;
        if let Some(message) = violations.into_error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script_lints();

    for rule in [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ] {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// Compiles this script on its own with unused code denied, so it follows the same
// policy as the crate.
fn check_build_script_lints() {
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--emit",
            "metadata",
            "-o",
        ])
        .arg(std::env::temp_dir().join("groupjoin-build-lint.rmeta"))
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for (needle, what) in [
                ("unused variable", "Unused variables"),
                ("is never used", "Unused functions"),
                ("unused import", "Unused imports"),
            ] {
                if stderr.contains(needle) {
                    eprintln!("\n❌ ERROR: {what} detected in build.rs!");
                    eprintln!("{stderr}");
                    eprintln!("\n⚠️ {what} are STRICTLY FORBIDDEN in this project.");
                    std::process::exit(1);
                }
            }
        }
        Ok(_) => {}
        Err(_) => {
            eprintln!(
                "cargo:warning=Could not check for unused variables/functions/imports in build.rs"
            );
        }
    }
}
