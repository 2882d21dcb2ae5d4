use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// A path that resolved outside the sandbox root.
///
/// This is never folded into an [`OperationResult`](crate::OperationResult);
/// it escapes to the caller as a hard denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("SECURITY VIOLATION: access denied to '{requested}' (path is outside the sandbox boundary {})", .root.display())]
pub struct SecurityViolation {
    pub requested: String,
    pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    SecurityViolation(#[from] SecurityViolation),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("file '{0}' is not valid UTF-8 text")]
    Decode(String),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
    #[error("process execution timed out after {limit:?}")]
    Timeout {
        limit: Duration,
        partial_output: String,
    },
    #[error("write failed: {0}")]
    WriteFailure(String),
    #[error("file too large: {0} bytes exceeds limit")]
    FileTooLarge(u64),
    #[error("'{0}' is inside the reserved backup directory")]
    ReservedPath(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            SandboxError::NotFound(_) => ErrorKind::NotFound,
            SandboxError::Decode(_) => ErrorKind::DecodeError,
            SandboxError::ToolExecution(_) => ErrorKind::ToolExecutionError,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::WriteFailure(_) => ErrorKind::WriteFailure,
            SandboxError::FileTooLarge(_) => ErrorKind::FileTooLarge,
            SandboxError::ReservedPath(_) => ErrorKind::ReservedPath,
            SandboxError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SandboxError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, SandboxError::SecurityViolation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecurityViolation,
    NotFound,
    DecodeError,
    ToolExecutionError,
    Timeout,
    WriteFailure,
    FileTooLarge,
    ReservedPath,
    InvalidOperation,
    Io,
    /// The test run completed but reported failures or errors.
    TestsFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::ReservedPath => "reserved_path",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Io => "io",
            ErrorKind::TestsFailed => "tests_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
