use std::path::Path;

use sandbox::{PathGuard, SandboxError, BACKUP_DIR_NAME};
use tempfile::TempDir;

#[test]
fn resolves_relative_paths_under_the_root() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();

    let resolved = guard.resolve("pkg/module.py").unwrap();
    assert!(resolved.starts_with(guard.root()));
    assert!(resolved.ends_with("pkg/module.py"));
    assert_eq!(guard.display_relative(&resolved), "pkg/module.py");
    assert_eq!(guard.display_relative(guard.root()), ".");
}

#[test]
fn rejects_parent_segments_even_when_they_land_inside() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();

    for requested in ["../evil.py", "pkg/../module.py", "a/b/../../../etc/passwd"] {
        let err = guard.resolve(requested).unwrap_err();
        assert!(err.is_security_violation(), "{requested} was accepted");
        assert!(err.to_string().starts_with("SECURITY VIOLATION"));
    }
}

#[test]
fn accepts_absolute_paths_only_inside_the_root() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();

    let inside = guard.root().join("module.py");
    assert_eq!(guard.resolve(&inside).unwrap(), inside);

    let err = guard.resolve("/etc/passwd").unwrap_err();
    match err {
        SandboxError::SecurityViolation(violation) => {
            assert_eq!(violation.requested, "/etc/passwd");
            assert_eq!(violation.root, guard.root());
        }
        other => panic!("expected a violation, got {other:?}"),
    }
}

#[test]
fn rejects_empty_paths() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();

    let err = guard.resolve("").unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
}

#[test]
fn requires_an_absolute_root() {
    let err = PathGuard::new("relative/root").unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
}

#[cfg(unix)]
#[test]
fn rejects_symlinks_pointing_outside() {
    let temp = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();
    std::os::unix::fs::symlink(outside.path(), guard.root().join("link")).unwrap();

    let err = guard.resolve("link/secret.txt").unwrap_err();
    assert!(err.is_security_violation());

    // A link whose target does not exist cannot be proven to stay inside.
    std::os::unix::fs::symlink("/nonexistent/target", guard.root().join("dangling")).unwrap();
    let err = guard.resolve("dangling").unwrap_err();
    assert!(err.is_security_violation());
}

#[cfg(unix)]
#[test]
fn follows_symlinks_that_stay_inside() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();
    std::fs::create_dir(guard.root().join("real")).unwrap();
    std::os::unix::fs::symlink(guard.root().join("real"), guard.root().join("alias")).unwrap();

    let resolved = guard.resolve("alias/file.py").unwrap();
    assert_eq!(resolved, guard.root().join("real").join("file.py"));
}

#[test]
fn marks_the_backup_tree_as_reserved() {
    let temp = TempDir::new().unwrap();
    let guard = PathGuard::new(temp.path()).unwrap();

    let inside = guard.resolve(Path::new(BACKUP_DIR_NAME).join("a.py")).unwrap();
    assert!(guard.is_reserved(&inside));
    assert!(guard.is_reserved(guard.backup_dir()));
    assert!(!guard.is_reserved(&guard.resolve(".backupsx/a.py").unwrap()));
}
