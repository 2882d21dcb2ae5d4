//! Static analysis through an external linter.
//!
//! The runner owns process handling; turning the linter's text into an
//! [`AnalysisReport`] is delegated to an [`AnalysisParser`], so a change in the
//! tool's output format stays behind that trait.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::errors::{Result, SandboxError};
use crate::path::PathGuard;
use crate::run::{self, ToolCommand};

/// Bit set in pylint's exit status when it was invoked incorrectly.
const PYLINT_USAGE_ERROR: i32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Error,
    Warning,
    Convention,
    Refactor,
}

impl IssueCategory {
    /// Maps a message id such as `W0611` to its class. Fatal counts as error;
    /// informational messages have no class.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.chars().next()? {
            'E' | 'F' => Some(IssueCategory::Error),
            'W' => Some(IssueCategory::Warning),
            'C' => Some(IssueCategory::Convention),
            'R' => Some(IssueCategory::Refactor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub code: String,
    pub symbol: Option<String>,
    pub message: String,
    pub category: IssueCategory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IssueCounts {
    pub errors: usize,
    pub warnings: usize,
    pub conventions: usize,
    pub refactors: usize,
}

impl IssueCounts {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.category {
                IssueCategory::Error => counts.errors += 1,
                IssueCategory::Warning => counts.warnings += 1,
                IssueCategory::Convention => counts.conventions += 1,
                IssueCategory::Refactor => counts.refactors += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.conventions + self.refactors
    }
}

/// What a parser extracts from raw linter output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAnalysis {
    pub score: Option<f64>,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub score: Option<f64>,
    pub total_issues: usize,
    #[serde(flatten)]
    pub counts: IssueCounts,
    pub issues: Vec<Issue>,
    pub raw_output: String,
    pub summary: String,
    pub file_path: String,
}

impl AnalysisReport {
    pub fn from_parsed(parsed: ParsedAnalysis, raw_output: String, file_path: String) -> Self {
        let score = parsed.score.map(|score| score.clamp(0.0, 10.0));
        let counts = IssueCounts::from_issues(&parsed.issues);
        Self {
            summary: summarize(score, &counts),
            total_issues: counts.total(),
            score,
            counts,
            issues: parsed.issues,
            raw_output,
            file_path,
        }
    }
}

pub trait AnalysisParser: Send + Sync + fmt::Debug {
    /// Arguments that make the tool print the format this parser reads.
    fn tool_args(&self) -> Vec<String>;

    fn parse(&self, raw_output: &str) -> ParsedAnalysis;
}

/// Reads pylint's default text reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PylintParser;

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"rated at (-?\d+(?:\.\d+)?)/10").expect("score pattern is valid")
    })
}

fn message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<path>[^:\s][^:]*):(?P<line>\d+):(?P<column>\d+): (?P<code>[A-Z]\d{4}): (?P<message>.*?)(?: \((?P<symbol>[a-z0-9-]+)\))?$",
        )
        .expect("message pattern is valid")
    })
}

impl AnalysisParser for PylintParser {
    fn tool_args(&self) -> Vec<String> {
        vec!["--output-format=text".to_string(), "--score=y".to_string()]
    }

    fn parse(&self, raw_output: &str) -> ParsedAnalysis {
        let mut parsed = ParsedAnalysis::default();
        for line in raw_output.lines() {
            let line = line.trim_end();
            if let Some(captures) = score_pattern().captures(line) {
                parsed.score = captures[1].parse().ok();
                continue;
            }
            let Some(captures) = message_pattern().captures(line) else {
                continue;
            };
            let Some(category) = IssueCategory::from_code(&captures["code"]) else {
                continue;
            };
            parsed.issues.push(Issue {
                path: captures["path"].to_string(),
                line: captures["line"].parse().unwrap_or(0),
                column: captures["column"].parse().unwrap_or(0),
                code: captures["code"].to_string(),
                symbol: captures.name("symbol").map(|m| m.as_str().to_string()),
                message: captures["message"].to_string(),
                category,
            });
        }
        parsed
    }
}

#[derive(Debug)]
pub struct AnalysisRunner {
    guard: PathGuard,
    command: ToolCommand,
    parser: Box<dyn AnalysisParser>,
}

impl AnalysisRunner {
    pub fn new(guard: PathGuard, command: ToolCommand) -> Self {
        Self {
            guard,
            command,
            parser: Box::new(PylintParser),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn AnalysisParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Lints one file or directory inside the sandbox.
    ///
    /// A linter that ran and found problems is a successful report; a linter
    /// that could not run is [`SandboxError::ToolExecution`].
    #[instrument(skip_all, fields(path = %relative.as_ref().display(), tool = %self.command.program()))]
    pub async fn analyze(&self, relative: impl AsRef<Path>) -> Result<AnalysisReport> {
        let relative = relative.as_ref();
        let target = self.guard.resolve(relative)?;
        if !target.exists() {
            return Err(SandboxError::NotFound(format!(
                "file not found: {}",
                relative.display()
            )));
        }

        let mut extra = self.parser.tool_args();
        extra.push(target.display().to_string());
        let request = self
            .command
            .request(extra)
            .with_working_dir(self.guard.root())
            .with_env(python_env());
        let output = run::execute(request).await?;

        let program = self.command.program();
        let exit_code = output.exit_code.ok_or_else(|| {
            SandboxError::ToolExecution(format!("{program} was terminated by a signal"))
        })?;
        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        if exit_code & PYLINT_USAGE_ERROR != 0 {
            return Err(SandboxError::ToolExecution(format!(
                "{program} reported a usage error (exit code {exit_code}): {}",
                first_non_empty(&stderr, &stdout)
            )));
        }

        let parsed = self.parser.parse(&stdout);
        if exit_code != 0 && parsed.score.is_none() && parsed.issues.is_empty() {
            return Err(SandboxError::ToolExecution(format!(
                "{program} exited with code {exit_code} without producing a report: {}",
                first_non_empty(&stderr, &stdout)
            )));
        }

        let mut raw_output = stdout;
        if !stderr.trim().is_empty() {
            raw_output.push('\n');
            raw_output.push_str(&stderr);
        }
        let report = AnalysisReport::from_parsed(parsed, raw_output, target.display().to_string());
        debug!(score = ?report.score, issues = report.total_issues, "analysis finished");
        Ok(report)
    }
}

pub(crate) fn python_env() -> Vec<(String, String)> {
    vec![("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]
}

pub(crate) fn first_non_empty<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    let primary = primary.trim();
    if primary.is_empty() {
        fallback.trim()
    } else {
        primary
    }
}

fn summarize(score: Option<f64>, counts: &IssueCounts) -> String {
    let Some(score) = score else {
        return "Unable to determine score".to_string();
    };
    let verdict = if score >= 9.0 {
        "Excellent code quality"
    } else if score >= 7.0 {
        "Good code quality"
    } else if score >= 5.0 {
        "Needs improvement"
    } else {
        "Poor code quality, significant refactoring needed"
    };
    format!(
        "Score: {score:.2}/10\nErrors: {}, Warnings: {}, Conventions: {}, Refactors: {}\n{verdict}",
        counts.errors, counts.warnings, counts.conventions, counts.refactors
    )
}
