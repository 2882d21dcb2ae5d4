//! Confined file, analysis and test tooling for code-refactoring agents.
//!
//! All filesystem access goes through a [`PathGuard`] rooted at one sandbox
//! directory. Files are rewritten atomically with optional timestamped
//! backups, and pylint and pytest run as bounded subprocesses. [`Toolbox`]
//! bundles the operations behind a uniform [`OperationResult`] envelope.

pub mod analysis;
pub mod backup;
pub mod errors;
pub mod fs;
pub mod path;
pub mod result;
pub mod run;
pub mod testing;
pub mod toolbox;

pub use analysis::{
    AnalysisParser, AnalysisReport, AnalysisRunner, Issue, IssueCategory, IssueCounts,
    ParsedAnalysis, PylintParser,
};
pub use backup::{BackupEntry, BackupId, BackupListing, BackupRecord, BackupStore, RestoreRecord};
pub use errors::{ErrorKind, Result, SandboxError, SecurityViolation};
pub use fs::{
    FileContent, FileCounts, FileInfo, FileListing, SandboxConfig, SandboxFs, SandboxInfo,
    TargetValidation, WriteReceipt, DEFAULT_MAX_FILE_SIZE,
};
pub use path::{PathGuard, BACKUP_DIR_NAME};
pub use result::{OperationError, OperationResult, Verdict};
pub use run::{detect_binary, execute, RunOutput, RunRequest, ToolCommand};
pub use testing::{FailureClass, PytestParser, TestCounts, TestOutputParser, TestReport, TestRunner};
pub use toolbox::{
    Outcome, Toolbox, ToolboxConfig, DEFAULT_ANALYSIS_TIMEOUT, DEFAULT_TEST_TIMEOUT,
};
