use serde::{Serialize, Serializer};

use crate::analysis::AnalysisReport;
use crate::backup::{BackupListing, BackupRecord, RestoreRecord};
use crate::errors::{ErrorKind, SandboxError, SecurityViolation};
use crate::fs::{FileContent, FileInfo, FileListing, SandboxInfo, WriteReceipt};

/// The failure half of an [`OperationResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    /// Output a timed out tool had produced before it was killed.
    pub partial_output: Option<String>,
}

impl From<SandboxError> for OperationError {
    fn from(err: SandboxError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        let partial_output = match err {
            SandboxError::Timeout { partial_output, .. } => Some(partial_output),
            _ => None,
        };
        Self {
            kind,
            message,
            partial_output,
        }
    }
}

/// Lets a payload mark a completed operation as unsuccessful on the wire.
///
/// A test run that finished with failing tests is still a `Success` in Rust,
/// but it serializes with `success: false` and an `error` next to its fields.
pub trait Verdict {
    fn failure(&self) -> Option<OperationError> {
        None
    }
}

// Findings from the linter are a successful analysis.
impl Verdict for AnalysisReport {}
impl Verdict for BackupListing {}
impl Verdict for BackupRecord {}
impl Verdict for FileContent {}
impl Verdict for FileInfo {}
impl Verdict for FileListing {}
impl Verdict for RestoreRecord {}
impl Verdict for SandboxInfo {}
impl Verdict for WriteReceipt {}

/// Uniform envelope for every toolbox operation.
///
/// Serializes flat: `success`, the payload fields on success, and `error`,
/// `error_kind` and (for timeouts) `partial_output` on failure. The payload's
/// [`Verdict`] decides `success` for completed operations.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult<T> {
    Success(T),
    Failure(OperationError),
}

impl<T> OperationResult<T> {
    /// Folds an operation's result into the envelope. Security violations are
    /// the one error that is not folded and come back as `Err`.
    pub fn capture(result: Result<T, SandboxError>) -> Result<Self, SecurityViolation> {
        match result {
            Ok(payload) => Ok(OperationResult::Success(payload)),
            Err(SandboxError::SecurityViolation(violation)) => Err(violation),
            Err(err) => Ok(OperationResult::Failure(err.into())),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success(_))
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            OperationResult::Success(payload) => Some(payload),
            OperationResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match self {
            OperationResult::Success(_) => None,
            OperationResult::Failure(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, OperationError> {
        match self {
            OperationResult::Success(payload) => Ok(payload),
            OperationResult::Failure(err) => Err(err),
        }
    }
}

#[derive(Serialize)]
struct Wire<'a, T> {
    success: bool,
    #[serde(flatten)]
    payload: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_output: Option<&'a str>,
}

impl<T: Serialize + Verdict> Serialize for OperationResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let verdict;
        let wire = match self {
            OperationResult::Success(payload) => {
                verdict = payload.failure();
                Wire {
                    success: verdict.is_none(),
                    payload: Some(payload),
                    error: verdict.as_ref().map(|err| err.message.as_str()),
                    error_kind: verdict.as_ref().map(|err| err.kind),
                    partial_output: verdict.as_ref().and_then(|err| err.partial_output.as_deref()),
                }
            }
            OperationResult::Failure(err) => Wire {
                success: false,
                payload: None,
                error: Some(&err.message),
                error_kind: Some(err.kind),
                partial_output: err.partial_output.as_deref(),
            },
        };
        wire.serialize(serializer)
    }
}
