use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::errors::{Result, SandboxError};
use crate::fs::atomic_write;
use crate::path::{PathGuard, BACKUP_DIR_NAME};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const MAX_NAME_ATTEMPTS: usize = 16;

fn backup_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<stem>.+)_(?P<stamp>\d{8}_\d{6}_\d{6})(?:\.(?P<ext>[^.]*))?$")
            .expect("backup name pattern is valid")
    })
}

/// Identity of a snapshot: which file, and when.
///
/// The on-disk name is derived from this pair only at the storage boundary:
/// `.backups/<parent>/<stem>_<YYYYmmdd_HHMMSS_ffffff>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupId {
    pub original: PathBuf,
    pub created: DateTime<Utc>,
}

impl BackupId {
    pub fn stamp(&self) -> String {
        self.created.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn file_name(&self) -> String {
        let stem = self
            .original
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.original.extension() {
            Some(ext) => format!("{stem}_{}.{}", self.stamp(), ext.to_string_lossy()),
            None => format!("{stem}_{}", self.stamp()),
        }
    }

    pub fn storage_path(&self, backup_dir: &Path) -> PathBuf {
        let mut path = backup_dir.to_path_buf();
        if let Some(parent) = self.original.parent().filter(|p| !p.as_os_str().is_empty()) {
            path.push(parent);
        }
        path.push(self.file_name());
        path
    }

    /// Recovers the identity from a path relative to the backup directory.
    pub fn parse(stored: &Path) -> Option<Self> {
        let name = stored.file_name()?.to_str()?;
        let captures = backup_name_pattern().captures(name)?;
        let naive = NaiveDateTime::parse_from_str(&captures["stamp"], TIMESTAMP_FORMAT).ok()?;
        let file_name = match captures.name("ext") {
            Some(ext) => format!("{}.{}", &captures["stem"], ext.as_str()),
            None => captures["stem"].to_string(),
        };
        let original = match stored.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        };
        Some(Self {
            original,
            created: naive.and_utc(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub backup_path: String,
    pub original_path: String,
    pub timestamp: String,
    #[serde(skip)]
    pub id: BackupId,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub path: String,
    pub original: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub backups: Vec<BackupEntry>,
    pub count: usize,
}

impl From<Vec<BackupEntry>> for BackupListing {
    fn from(backups: Vec<BackupEntry>) -> Self {
        Self {
            count: backups.len(),
            backups,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreRecord {
    pub restored_to: String,
    pub from_backup: String,
}

/// Append-only catalog of file snapshots under `<root>/.backups`.
///
/// Snapshots mirror the original's parent directories, so `pkg/util.py` is
/// stored as `.backups/pkg/util_<stamp>.py` and a top-level `util.py` as
/// `.backups/util_<stamp>.py`. Two files with the same name in different
/// directories therefore never share a listing. The catalog is the directory
/// listing itself; nothing else is persisted.
#[derive(Debug)]
pub struct BackupStore {
    guard: PathGuard,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl BackupStore {
    pub fn new(guard: PathGuard) -> Result<Self> {
        fs::create_dir_all(guard.backup_dir())?;
        Ok(Self {
            guard,
            last_stamp: Mutex::new(None),
        })
    }

    pub fn backup_dir(&self) -> &Path {
        self.guard.backup_dir()
    }

    #[instrument(skip_all, fields(path = %relative.as_ref().display()))]
    pub fn create_backup(&self, relative: impl AsRef<Path>) -> Result<BackupRecord> {
        let source = self.guard.resolve(relative.as_ref())?;
        self.snapshot(&source)
    }

    /// Copies an already resolved file into a fresh backup.
    pub(crate) fn snapshot(&self, source: &Path) -> Result<BackupRecord> {
        let display = self.guard.display_relative(source);
        if self.guard.is_reserved(source) {
            return Err(SandboxError::ReservedPath(display));
        }
        if !source.is_file() {
            return Err(SandboxError::NotFound(format!(
                "cannot back up non-existent file: {display}"
            )));
        }
        let bytes = fs::read(source)?;
        let original = self.guard.relative(source);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = BackupId {
                original: original.clone(),
                created: self.next_stamp(),
            };
            let path = id.storage_path(self.guard.backup_dir());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    SandboxError::WriteFailure(format!(
                        "cannot prepare backup directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(SandboxError::WriteFailure(format!(
                        "cannot create backup '{}': {err}",
                        path.display()
                    )))
                }
            };
            if let Err(err) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
                let _ = fs::remove_file(&path);
                return Err(SandboxError::WriteFailure(format!(
                    "cannot write backup '{}': {err}",
                    path.display()
                )));
            }
            debug!(backup = %path.display(), size = bytes.len(), "backup created");
            return Ok(BackupRecord {
                backup_path: path.display().to_string(),
                original_path: source.display().to_string(),
                timestamp: id.stamp(),
                id,
            });
        }

        Err(SandboxError::WriteFailure(format!(
            "could not allocate a unique backup name for '{display}'"
        )))
    }

    /// Lists backups newest first, optionally only those of one file.
    #[instrument(skip(self))]
    pub fn list_backups(&self, original: Option<&Path>) -> Result<Vec<BackupEntry>> {
        let filter = match original {
            Some(path) => Some(self.guard.relative(&self.guard.resolve(path)?)),
            None => None,
        };
        let backup_dir = self.guard.backup_dir();
        if !backup_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(backup_dir).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(stored) = entry.path().strip_prefix(backup_dir) else {
                continue;
            };
            let Some(id) = BackupId::parse(stored) else {
                continue;
            };
            if filter.as_ref().is_some_and(|wanted| *wanted != id.original) {
                continue;
            }
            let metadata = entry.metadata().map_err(io::Error::from)?;
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(id.created);
            entries.push(BackupEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().display().to_string(),
                original: id.original.to_string_lossy().replace('\\', "/"),
                size_bytes: metadata.len(),
                modified,
                created: id.created,
            });
        }
        entries.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(entries)
    }

    pub fn latest_backup(&self, original: impl AsRef<Path>) -> Result<Option<BackupEntry>> {
        Ok(self
            .list_backups(Some(original.as_ref()))?
            .into_iter()
            .next())
    }

    /// Overwrites `target` with the stored bytes of `backup`.
    ///
    /// The pre-restore content of `target` is not snapshotted; callers that
    /// want that safety net call [`BackupStore::create_backup`] first.
    #[instrument(skip_all, fields(backup = %backup.as_ref().display(), target = %target.as_ref().display()))]
    pub fn restore(
        &self,
        backup: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<RestoreRecord> {
        let target = self.guard.resolve(target.as_ref())?;
        self.restore_to(backup.as_ref(), &target)
    }

    pub(crate) fn restore_to(&self, backup: &Path, target: &Path) -> Result<RestoreRecord> {
        let source = self.resolve_backup(backup)?;
        if self.guard.is_reserved(target) {
            return Err(SandboxError::ReservedPath(
                self.guard.display_relative(target),
            ));
        }
        if target.is_dir() {
            return Err(SandboxError::InvalidOperation(format!(
                "restore target '{}' is a directory",
                self.guard.display_relative(target)
            )));
        }
        let bytes = fs::read(&source)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| SandboxError::WriteFailure(err.to_string()))?;
        }
        atomic_write(target, &bytes)?;
        debug!(from = %source.display(), to = %target.display(), "backup restored");
        Ok(RestoreRecord {
            restored_to: target.display().to_string(),
            from_backup: source.display().to_string(),
        })
    }

    // Accepts an absolute path, a sandbox-relative `.backups/...` path, or a
    // path relative to the backup directory itself.
    fn resolve_backup(&self, backup: &Path) -> Result<PathBuf> {
        let mut resolved = self.guard.resolve(backup)?;
        if !self.guard.is_reserved(&resolved) && backup.is_relative() {
            resolved = self.guard.resolve(Path::new(BACKUP_DIR_NAME).join(backup))?;
        }
        if !self.guard.is_reserved(&resolved) || resolved == self.guard.backup_dir() {
            return Err(SandboxError::InvalidOperation(format!(
                "backup path '{}' must point into the {BACKUP_DIR_NAME} directory",
                backup.display()
            )));
        }
        if !resolved.is_file() {
            return Err(SandboxError::NotFound(format!(
                "backup file not found: {}",
                backup.display()
            )));
        }
        Ok(resolved)
    }

    // Microsecond stamps that never repeat within this store.
    fn next_stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock();
        let mut stamp = Utc::now().trunc_subsecs(6);
        if let Some(previous) = *last {
            if stamp <= previous {
                stamp = previous + Duration::microseconds(1);
            }
        }
        *last = Some(stamp);
        stamp
    }
}
