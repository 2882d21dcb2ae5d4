//! Test execution through an external test runner.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::analysis::{first_non_empty, python_env};
use crate::errors::{ErrorKind, Result, SandboxError};
use crate::path::PathGuard;
use crate::result::{OperationError, Verdict};
use crate::run::{self, ToolCommand};

/// pytest's exit status when collection found nothing to run.
const PYTEST_NO_TESTS: i32 = 5;

/// Coarse reason a test run did not pass, found by scanning its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Syntax or collection errors kept every test from running.
    CollectionError,
    /// Tests ran and at least one asserted false.
    AssertionFailure,
    /// A module could not be imported during collection.
    ImportError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl TestCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errors + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub total: usize,
    /// No failed or errored tests. Carried on the wire by the envelope's
    /// `success` key.
    #[serde(skip)]
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub full_output: String,
    pub return_code: Option<i32>,
    pub test_path: String,
    pub summary: String,
    pub failure_class: Option<FailureClass>,
}

impl Verdict for TestReport {
    fn failure(&self) -> Option<OperationError> {
        if self.success {
            return None;
        }
        Some(OperationError {
            kind: ErrorKind::TestsFailed,
            message: format!(
                "{} of {} tests failed, {} errors",
                self.failed, self.total, self.errors
            ),
            partial_output: None,
        })
    }
}

pub trait TestOutputParser: Send + Sync + fmt::Debug {
    fn tool_args(&self, verbose: bool) -> Vec<String>;

    /// Counts from the run's summary line, or `None` when there is none.
    fn parse_counts(&self, output: &str) -> Option<TestCounts>;

    fn classify(&self, output: &str, counts: &TestCounts) -> Option<FailureClass>;
}

/// Reads pytest's terminal reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PytestParser;

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<body>(?:\d+ [a-z]+(?:, )?)+|no tests ran) in \d+(?:\.\d+)?s(?: \([\d:.]+\))?$",
        )
        .expect("summary pattern is valid")
    })
}

const IMPORT_MARKERS: &[&str] = &["ModuleNotFoundError", "ImportError"];
/// Lines pytest prints only when a module failed during collection.
const COLLECTION_FAILURE_MARKERS: &[&str] = &["ImportError while importing", "ERROR collecting"];
const COLLECTION_MARKERS: &[&str] = &[
    "SyntaxError",
    "IndentationError",
    "ERROR collecting",
    "error during collection",
    "errors during collection",
];

impl TestOutputParser for PytestParser {
    fn tool_args(&self, verbose: bool) -> Vec<String> {
        let mut args = Vec::new();
        if verbose {
            args.push("-v".to_string());
        }
        args.extend(
            ["--tb=short", "--no-header", "-p", "no:cacheprovider"]
                .into_iter()
                .map(str::to_string),
        );
        args
    }

    fn parse_counts(&self, output: &str) -> Option<TestCounts> {
        output.lines().rev().find_map(|line| {
            let line = line.trim().trim_matches('=').trim();
            let captures = summary_pattern().captures(line)?;
            let mut counts = TestCounts::default();
            for part in captures["body"].split(", ") {
                let Some((number, word)) = part.split_once(' ') else {
                    continue;
                };
                let Ok(number) = number.parse::<usize>() else {
                    continue;
                };
                match word {
                    "passed" => counts.passed += number,
                    "failed" => counts.failed += number,
                    "error" | "errors" => counts.errors += number,
                    "skipped" => counts.skipped += number,
                    _ => {}
                }
            }
            Some(counts)
        })
    }

    fn classify(&self, output: &str, counts: &TestCounts) -> Option<FailureClass> {
        let contains_any = |markers: &[&str]| markers.iter().any(|m| output.contains(m));
        let nothing_ran = counts.passed == 0 && counts.failed == 0;
        // An import inside a test body that fails is that test's failure.
        if contains_any(IMPORT_MARKERS)
            && (nothing_ran || contains_any(COLLECTION_FAILURE_MARKERS))
        {
            return Some(FailureClass::ImportError);
        }
        if nothing_ran && contains_any(COLLECTION_MARKERS) {
            return Some(FailureClass::CollectionError);
        }
        if counts.failed > 0 {
            return Some(FailureClass::AssertionFailure);
        }
        None
    }
}

#[derive(Debug)]
pub struct TestRunner {
    guard: PathGuard,
    command: ToolCommand,
    parser: Box<dyn TestOutputParser>,
}

impl TestRunner {
    pub fn new(guard: PathGuard, command: ToolCommand) -> Self {
        Self {
            guard,
            command,
            parser: Box::new(PytestParser),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn TestOutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Runs the tests under `target`, or the whole sandbox when it is `None`.
    #[instrument(skip(self), fields(tool = %self.command.program()))]
    pub async fn run(&self, target: Option<&Path>, verbose: bool) -> Result<TestReport> {
        let target = match target {
            Some(relative) => {
                let resolved = self.guard.resolve(relative)?;
                if !resolved.exists() {
                    return Err(SandboxError::NotFound(format!(
                        "test path not found: {}",
                        relative.display()
                    )));
                }
                resolved
            }
            None => self.guard.root().to_path_buf(),
        };

        let mut extra = vec![target.display().to_string()];
        extra.extend(self.parser.tool_args(verbose));
        let request = self
            .command
            .request(extra)
            .with_working_dir(self.guard.root())
            .with_env(python_env());
        let output = run::execute(request).await?;

        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        let full_output = format!("{stdout}\n{stderr}");
        let counts = match self.parser.parse_counts(&stdout) {
            Some(counts) => counts,
            None if matches!(output.exit_code, Some(0) | Some(PYTEST_NO_TESTS)) => {
                TestCounts::default()
            }
            None => {
                let program = self.command.program();
                let status = output
                    .exit_code
                    .map(|code| format!("exit code {code}"))
                    .unwrap_or_else(|| "a signal".to_string());
                return Err(SandboxError::ToolExecution(format!(
                    "{program} ended with {status} without a result summary: {}",
                    first_non_empty(&stderr, &stdout)
                )));
            }
        };

        let success = counts.failed == 0 && counts.errors == 0;
        let failure_class = self.parser.classify(&full_output, &counts);
        debug!(
            passed = counts.passed,
            failed = counts.failed,
            errors = counts.errors,
            ?failure_class,
            "test run finished"
        );
        Ok(TestReport {
            passed: counts.passed,
            failed: counts.failed,
            errors: counts.errors,
            skipped: counts.skipped,
            total: counts.total(),
            success,
            summary: summarize(&counts, success),
            stdout,
            stderr,
            full_output,
            return_code: output.exit_code,
            test_path: target.display().to_string(),
            failure_class,
        })
    }
}

fn summarize(counts: &TestCounts, success: bool) -> String {
    if counts.total() == 0 {
        return "No tests found or collected".to_string();
    }
    let mut summary = format!("Total: {} tests", counts.total());
    for (label, value) in [
        ("Passed", counts.passed),
        ("Failed", counts.failed),
        ("Errors", counts.errors),
        ("Skipped", counts.skipped),
    ] {
        if value > 0 {
            summary.push_str(&format!(" | {label}: {value}"));
        }
    }
    summary.push('\n');
    summary.push_str(if success {
        "ALL TESTS PASSED"
    } else {
        "SOME TESTS FAILED, review output for details"
    });
    summary
}
