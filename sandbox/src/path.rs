use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::errors::{Result, SandboxError, SecurityViolation};

/// Reserved subdirectory of the sandbox root holding file snapshots.
pub const BACKUP_DIR_NAME: &str = ".backups";

pub fn ensure_absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_relative() {
        return Err(SandboxError::InvalidOperation(
            "sandbox base directory must be absolute".to_string(),
        ));
    }
    Ok(base_dir.to_path_buf())
}

/// Confines caller-supplied paths to a single canonical root directory.
#[derive(Clone, Debug)]
pub struct PathGuard {
    root: PathBuf,
    backup_dir: PathBuf,
}

impl PathGuard {
    /// Creates the root if needed and pins its canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let base = ensure_absolute_base(root.as_ref())?;
        fs::create_dir_all(&base)?;
        let root = base.canonicalize()?;
        let backup_dir = root.join(BACKUP_DIR_NAME);
        Ok(Self { root, backup_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Resolves `requested` to a canonical absolute path inside the root.
    ///
    /// Relative paths are joined to the root; absolute paths are accepted only
    /// when they already point inside it. Any `..` segment is a violation even
    /// if it would land back inside the root. Symlinks are followed, so a link
    /// pointing outside the sandbox is rejected as well.
    pub fn resolve(&self, requested: impl AsRef<Path>) -> Result<PathBuf> {
        let requested = requested.as_ref();
        if requested.as_os_str().is_empty() {
            return Err(SandboxError::InvalidOperation(
                "path must not be empty".to_string(),
            ));
        }
        if requested
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(self.violation(requested));
        }

        let joined = self.root.join(requested);
        match canonicalize_existing(&joined)? {
            Some(canonical) if canonical.starts_with(&self.root) => Ok(canonical),
            _ => Err(self.violation(requested)),
        }
    }

    /// Maps a resolved absolute path back to its root-relative form.
    pub fn relative(&self, absolute: &Path) -> PathBuf {
        absolute
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute.to_path_buf())
    }

    pub fn display_relative(&self, absolute: &Path) -> String {
        let relative = self.relative(absolute);
        if relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            relative.to_string_lossy().replace('\\', "/")
        }
    }

    /// True for the backup directory itself and anything below it.
    pub fn is_reserved(&self, absolute: &Path) -> bool {
        absolute.starts_with(&self.backup_dir)
    }

    fn violation(&self, requested: &Path) -> SandboxError {
        warn!(
            target: "sandbox::security",
            requested = %requested.display(),
            root = %self.root.display(),
            "policy breach: path escapes sandbox"
        );
        SandboxError::SecurityViolation(SecurityViolation {
            requested: requested.display().to_string(),
            root: self.root.clone(),
        })
    }
}

// Canonicalizes the deepest existing ancestor and re-appends the missing tail.
// Returns `None` when a dangling symlink sits on the way.
fn canonicalize_existing(path: &Path) -> io::Result<Option<PathBuf>> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for part in tail.iter().rev() {
                    canonical.push(part);
                }
                return Ok(Some(canonical));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if fs::symlink_metadata(&existing).is_ok() {
                    return Ok(None);
                }
                match existing.file_name() {
                    Some(name) => {
                        tail.push(name.to_os_string());
                        existing.pop();
                    }
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
