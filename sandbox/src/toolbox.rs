//! The operation surface handed to agents.
//!
//! Every operation returns `Result<OperationResult<_>, SecurityViolation>`:
//! ordinary failures are folded into the envelope, while a path that escapes
//! the sandbox is a hard `Err` the caller cannot mistake for a soft failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::analysis::{AnalysisReport, AnalysisRunner};
use crate::backup::{BackupListing, BackupRecord, RestoreRecord};
use crate::errors::{SandboxError, SecurityViolation};
use crate::fs::{
    FileContent, FileInfo, FileListing, SandboxConfig, SandboxFs, SandboxInfo, TargetValidation,
    WriteReceipt, DEFAULT_MAX_FILE_SIZE,
};
use crate::result::OperationResult;
use crate::run::ToolCommand;
use crate::testing::{TestReport, TestRunner};

pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type Outcome<T> = Result<OperationResult<T>, SecurityViolation>;

#[derive(Clone, Debug)]
pub struct ToolboxConfig {
    pub root: PathBuf,
    pub max_file_size: u64,
    pub pylint: ToolCommand,
    pub pytest: ToolCommand,
}

impl ToolboxConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            pylint: ToolCommand::program_only("pylint", DEFAULT_ANALYSIS_TIMEOUT),
            pytest: ToolCommand::program_only("pytest", DEFAULT_TEST_TIMEOUT),
        }
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_pylint(mut self, command: ToolCommand) -> Self {
        self.pylint = command;
        self
    }

    pub fn with_pytest(mut self, command: ToolCommand) -> Self {
        self.pytest = command;
        self
    }
}

#[derive(Debug)]
pub struct Toolbox {
    fs: SandboxFs,
    analysis: AnalysisRunner,
    tests: TestRunner,
}

impl Toolbox {
    pub fn new(config: ToolboxConfig) -> crate::Result<Self> {
        let fs = SandboxFs::new(SandboxConfig::new(&config.root, config.max_file_size)?)?;
        let analysis = AnalysisRunner::new(fs.guard().clone(), config.pylint);
        let tests = TestRunner::new(fs.guard().clone(), config.pytest);
        Ok(Self {
            fs,
            analysis,
            tests,
        })
    }

    /// Swaps in custom runners, e.g. with a different output parser.
    pub fn with_runners(mut self, analysis: AnalysisRunner, tests: TestRunner) -> Self {
        self.analysis = analysis;
        self.tests = tests;
        self
    }

    pub fn root(&self) -> &Path {
        self.fs.base_dir()
    }

    pub fn fs(&self) -> &SandboxFs {
        &self.fs
    }

    #[instrument(skip(self))]
    pub fn read_file(&self, path: &Path) -> Outcome<FileContent> {
        record("read_file", OperationResult::capture(self.fs.read_file(path)))
    }

    #[instrument(skip(self, content), fields(size = content.len()))]
    pub fn write_file(&self, path: &Path, content: &str, create_backup: bool) -> Outcome<WriteReceipt> {
        record(
            "write_file",
            OperationResult::capture(self.fs.write_file(path, content, create_backup)),
        )
    }

    #[instrument(skip(self))]
    pub fn create_backup(&self, path: &Path) -> Outcome<BackupRecord> {
        record(
            "create_backup",
            OperationResult::capture(self.fs.backups().create_backup(path)),
        )
    }

    /// Overwrites `target` with the backup's content. The current content of
    /// `target` is not backed up first.
    #[instrument(skip(self))]
    pub fn restore_backup(&self, backup: &Path, target: &Path) -> Outcome<RestoreRecord> {
        record(
            "restore_backup",
            OperationResult::capture(self.fs.restore_backup(backup, target)),
        )
    }

    #[instrument(skip(self))]
    pub fn list_backups(&self, path: Option<&Path>) -> Outcome<BackupListing> {
        let listing = self.fs.backups().list_backups(path).map(BackupListing::from);
        record("list_backups", OperationResult::capture(listing))
    }

    #[instrument(skip(self))]
    pub fn list_files(&self, pattern: &str) -> Outcome<FileListing> {
        record("list_files", OperationResult::capture(self.fs.list_files(pattern)))
    }

    #[instrument(skip(self))]
    pub fn file_info(&self, path: &Path) -> Outcome<FileInfo> {
        record("file_info", OperationResult::capture(self.fs.file_info(path)))
    }

    #[instrument(skip(self))]
    pub async fn run_pylint(&self, path: &Path) -> Outcome<AnalysisReport> {
        record(
            "run_pylint",
            OperationResult::capture(self.analysis.analyze(path).await),
        )
    }

    #[instrument(skip(self))]
    pub async fn run_pytest(&self, target: Option<&Path>, verbose: bool) -> Outcome<TestReport> {
        record(
            "run_pytest",
            OperationResult::capture(self.tests.run(target, verbose).await),
        )
    }

    /// Never fails softly: anything short of a security violation is reported
    /// as an invalid target.
    #[instrument(skip(self))]
    pub fn validate_target_dir(&self, path: &Path) -> Result<TargetValidation, SecurityViolation> {
        match self.fs.validate_target_dir(path) {
            Ok(validation) => Ok(validation),
            Err(SandboxError::SecurityViolation(violation)) => Err(violation),
            Err(err) => Ok(TargetValidation::invalid(
                path.display().to_string(),
                err.to_string(),
            )),
        }
    }

    pub fn sandbox_info(&self) -> OperationResult<SandboxInfo> {
        match self.fs.sandbox_info() {
            Ok(info) => OperationResult::Success(info),
            Err(err) => OperationResult::Failure(err.into()),
        }
    }
}

fn record<T>(operation: &'static str, outcome: Outcome<T>) -> Outcome<T> {
    match &outcome {
        Ok(OperationResult::Success(_)) => info!(operation, "operation succeeded"),
        Ok(OperationResult::Failure(err)) => warn!(
            operation,
            error_kind = err.kind.as_str(),
            error = %err.message,
            "operation failed"
        ),
        // The guard has already logged the violation itself.
        Err(_) => {}
    }
    outcome
}
