use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::backup::{BackupStore, RestoreRecord};
use crate::errors::{Result, SandboxError};
use crate::path::{self, PathGuard};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub base_dir: PathBuf,
    pub max_file_size: u64,
}

impl SandboxConfig {
    pub fn new(base_dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let base = path::ensure_absolute_base(base_dir.as_ref())?;
        fs::create_dir_all(&base)?;
        Ok(Self {
            base_dir: base,
            max_file_size,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub content: String,
    pub path: String,
    pub size_bytes: u64,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    pub path: String,
    pub backup_path: Option<String>,
    pub bytes_written: u64,
    pub lines_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    pub files: Vec<String>,
    pub count: usize,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
    pub lines: usize,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub python_files: usize,
    pub test_files: usize,
    pub other_files: usize,
    pub backups: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetValidation {
    pub valid: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_counts: Option<FileCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub sandbox_path: String,
    pub backup_path: String,
    pub python_files: usize,
    pub test_files: usize,
    pub backups_available: usize,
}

/// Text file access confined to one sandbox root.
///
/// Writes fully replace content through a temp file in the target directory
/// and are serialized per resolved path, so a backup is never taken from a
/// half-written file.
#[derive(Debug)]
pub struct SandboxFs {
    guard: PathGuard,
    backups: BackupStore,
    max_file_size: u64,
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SandboxFs {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let guard = PathGuard::new(&config.base_dir)?;
        let backups = BackupStore::new(guard.clone())?;
        Ok(Self {
            guard,
            backups,
            max_file_size: config.max_file_size,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        self.guard.root()
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    #[instrument(skip_all, fields(path = %relative.as_ref().display()))]
    pub fn read_file(&self, relative: impl AsRef<Path>) -> Result<FileContent> {
        let relative = relative.as_ref();
        let path = self.guard.resolve(relative)?;
        if !path.exists() {
            return Err(SandboxError::NotFound(format!(
                "file not found: {}",
                relative.display()
            )));
        }
        if !path.is_file() {
            return Err(SandboxError::InvalidOperation(format!(
                "path is not a file: {}",
                relative.display()
            )));
        }
        let metadata = fs::metadata(&path)?;
        if metadata.len() > self.max_file_size {
            return Err(SandboxError::FileTooLarge(metadata.len()));
        }
        let bytes = fs::read(&path)?;
        let content = String::from_utf8(bytes)
            .map_err(|_| SandboxError::Decode(relative.display().to_string()))?;
        Ok(FileContent {
            size_bytes: content.len() as u64,
            lines: count_lines(&content),
            path: path.display().to_string(),
            content,
        })
    }

    /// Replaces the whole content of a file, snapshotting it first when asked.
    ///
    /// A failed snapshot aborts the write and leaves the file untouched.
    #[instrument(skip_all, fields(path = %relative.as_ref().display(), size = content.len()))]
    pub fn write_file(
        &self,
        relative: impl AsRef<Path>,
        content: &str,
        create_backup: bool,
    ) -> Result<WriteReceipt> {
        let relative = relative.as_ref();
        let path = self.guard.resolve(relative)?;
        if self.guard.is_reserved(&path) {
            return Err(SandboxError::ReservedPath(relative.display().to_string()));
        }
        if path.is_dir() {
            return Err(SandboxError::InvalidOperation(format!(
                "path is a directory: {}",
                relative.display()
            )));
        }
        let size = content.len() as u64;
        if size > self.max_file_size {
            return Err(SandboxError::FileTooLarge(size));
        }

        self.with_write_lock(&path, || {
            self.replace_locked(&path, relative, content, create_backup)
        })
    }

    // Callers hold the write lock for `path`.
    fn replace_locked(
        &self,
        path: &Path,
        relative: &Path,
        content: &str,
        create_backup: bool,
    ) -> Result<WriteReceipt> {
        let size = content.len() as u64;
        let backup_path = if create_backup && path.is_file() {
            let record = self.backups.snapshot(path).map_err(|err| {
                SandboxError::WriteFailure(format!(
                    "backup of '{}' failed, file left unchanged: {err}",
                    relative.display()
                ))
            })?;
            Some(record.backup_path)
        } else {
            None
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                SandboxError::WriteFailure(format!(
                    "cannot create parent directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
        atomic_write(path, content.as_bytes())?;
        debug!(backup = ?backup_path, "file written");

        Ok(WriteReceipt {
            path: path.display().to_string(),
            backup_path,
            bytes_written: size,
            lines_written: count_lines(content),
        })
    }

    /// Restores a backup over `target` while holding the target's write lock.
    pub fn restore_backup(
        &self,
        backup: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<RestoreRecord> {
        let target = self.guard.resolve(target.as_ref())?;
        self.with_write_lock(&target, || self.backups.restore_to(backup.as_ref(), &target))
    }

    /// Files under the root matching `pattern`, never including backups.
    ///
    /// A pattern without `/` matches file names at any depth; one with `/`
    /// matches the root-relative path.
    #[instrument(skip(self))]
    pub fn list_files(&self, pattern: &str) -> Result<FileListing> {
        let pattern = if pattern.trim().is_empty() {
            "*"
        } else {
            pattern.trim()
        };
        let matcher = build_matcher(pattern)?;
        let mut files = Vec::new();
        for path in self.walk(self.guard.root())? {
            let relative = self.guard.relative(&path);
            if matcher.is_match(&relative) {
                files.push(self.guard.display_relative(&path));
            }
        }
        files.sort();
        Ok(FileListing {
            count: files.len(),
            files,
            pattern: pattern.to_string(),
        })
    }

    #[instrument(skip_all, fields(path = %relative.as_ref().display()))]
    pub fn file_info(&self, relative: impl AsRef<Path>) -> Result<FileInfo> {
        let path = self.guard.resolve(relative.as_ref())?;
        let display = path.display().to_string();
        if !path.is_file() {
            return Ok(FileInfo {
                path: display,
                exists: false,
                size_bytes: 0,
                lines: 0,
                modified: None,
            });
        }
        let metadata = fs::metadata(&path)?;
        let lines = fs::read(&path)
            .map(|bytes| count_lines(&String::from_utf8_lossy(&bytes)))
            .unwrap_or(0);
        Ok(FileInfo {
            path: display,
            exists: true,
            size_bytes: metadata.len(),
            lines,
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Read-only health check of a directory before a session starts.
    #[instrument(skip_all, fields(path = %relative.as_ref().display()))]
    pub fn validate_target_dir(&self, relative: impl AsRef<Path>) -> Result<TargetValidation> {
        let relative = relative.as_ref();
        let path = self.guard.resolve(relative)?;
        let display = path.display().to_string();
        if !path.exists() {
            return Ok(TargetValidation::invalid(
                display,
                format!("directory does not exist: {}", relative.display()),
            ));
        }
        if !path.is_dir() {
            return Ok(TargetValidation::invalid(
                display,
                format!("path is not a directory: {}", relative.display()),
            ));
        }

        let mut counts = FileCounts {
            backups: self.backups.list_backups(None)?.len(),
            ..FileCounts::default()
        };
        for file in self.walk(&path)? {
            match classify(&file) {
                FileCategory::Test => {
                    counts.python_files += 1;
                    counts.test_files += 1;
                }
                FileCategory::Python => counts.python_files += 1,
                FileCategory::Other => counts.other_files += 1,
            }
        }
        Ok(TargetValidation {
            valid: true,
            relative_path: Some(self.guard.display_relative(&path)),
            path: display,
            error: None,
            file_counts: Some(counts),
        })
    }

    pub fn sandbox_info(&self) -> Result<SandboxInfo> {
        let mut python_files = 0;
        let mut test_files = 0;
        for file in self.walk(self.guard.root())? {
            match classify(&file) {
                FileCategory::Test => {
                    python_files += 1;
                    test_files += 1;
                }
                FileCategory::Python => python_files += 1,
                FileCategory::Other => {}
            }
        }
        Ok(SandboxInfo {
            sandbox_path: self.guard.root().display().to_string(),
            backup_path: self.guard.backup_dir().display().to_string(),
            python_files,
            test_files,
            backups_available: self.backups.list_backups(None)?.len(),
        })
    }

    // Regular files below `dir`, skipping the reserved backup subtree.
    fn walk(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.guard.is_reserved(entry.path()));
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Runs `f` while holding the per-path write lock, then drops the table
    /// entry once no other writer holds or waits on it.
    fn with_write_lock<T>(&self, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .write_locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let result = {
            let _held = lock.lock();
            f()
        };
        let mut table = self.write_locks.lock();
        // One reference in the table and ours: nobody else is queued.
        if Arc::strong_count(&lock) == 2 {
            table.remove(path);
        }
        result
    }
}

impl TargetValidation {
    pub(crate) fn invalid(path: String, error: String) -> Self {
        Self {
            valid: false,
            path,
            relative_path: None,
            error: Some(error),
            file_counts: None,
        }
    }
}

/// Writes through a sibling temp file and renames it over `path`.
///
/// Existing permissions are carried over to the new file.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let failure = |err: io::Error| {
        SandboxError::WriteFailure(format!("cannot write '{}': {err}", path.display()))
    };
    let parent = path
        .parent()
        .ok_or_else(|| SandboxError::InvalidOperation("path has no parent".to_string()))?;
    let mut temp = NamedTempFile::new_in(parent).map_err(failure)?;
    temp.write_all(bytes).map_err(failure)?;
    temp.as_file().sync_all().map_err(failure)?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions()).map_err(failure)?;
    }
    temp.persist(path).map_err(|err| failure(err.error))?;
    Ok(())
}

pub(crate) fn count_lines(content: &str) -> usize {
    content.lines().count()
}

enum FileCategory {
    Test,
    Python,
    Other,
}

fn classify(path: &Path) -> FileCategory {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    if !name.ends_with(".py") {
        FileCategory::Other
    } else if name.starts_with("test_") || name.ends_with("_test.py") {
        FileCategory::Test
    } else {
        FileCategory::Python
    }
}

fn build_matcher(pattern: &str) -> Result<GlobMatcher> {
    let expanded = if pattern.contains('/') {
        pattern.to_string()
    } else {
        format!("**/{pattern}")
    };
    let glob = GlobBuilder::new(&expanded)
        .literal_separator(true)
        .build()
        .map_err(|err| {
            SandboxError::InvalidOperation(format!("invalid glob pattern '{pattern}': {err}"))
        })?;
    Ok(glob.compile_matcher())
}
