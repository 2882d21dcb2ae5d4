use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use sandbox::{SandboxConfig, SandboxError, SandboxFs};
use tempfile::TempDir;

fn sandbox(temp: &TempDir, max_file_size: u64) -> SandboxFs {
    let config = SandboxConfig::new(temp.path(), max_file_size).unwrap();
    SandboxFs::new(config).unwrap()
}

#[test]
fn write_and_read_roundtrip() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);

    let receipt = fs.write_file("pkg/example.py", "a = 1\nb = 2\n", true).unwrap();
    assert_eq!(receipt.bytes_written, 12);
    assert_eq!(receipt.lines_written, 2);
    // Nothing to back up for a new file.
    assert!(receipt.backup_path.is_none());

    let read = fs.read_file("pkg/example.py").unwrap();
    assert_eq!(read.content, "a = 1\nb = 2\n");
    assert_eq!(read.lines, 2);
    assert_eq!(read.size_bytes, 12);
}

#[test]
fn overwrite_snapshots_previous_content() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);

    fs.write_file("module.py", "old\n", true).unwrap();
    let receipt = fs.write_file("module.py", "new\n", true).unwrap();
    let backup = receipt.backup_path.expect("existing file is backed up");
    assert_eq!(fs::read_to_string(backup).unwrap(), "old\n");
    assert_eq!(fs.read_file("module.py").unwrap().content, "new\n");

    let receipt = fs.write_file("module.py", "newer\n", false).unwrap();
    assert!(receipt.backup_path.is_none());
    assert_eq!(fs.backups().list_backups(None).unwrap().len(), 1);
}

#[test]
fn prevent_path_traversal() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);

    let err = fs.write_file("../evil.py", "bad", false).unwrap_err();
    assert!(err.is_security_violation());
    assert!(!temp.path().parent().unwrap().join("evil.py").exists());

    let err = fs.read_file("/etc/passwd").unwrap_err();
    assert!(err.is_security_violation());
}

#[test]
fn enforce_file_size_limit() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 4);

    let err = fs.write_file("large.py", "12345", false).unwrap_err();
    assert!(matches!(err, SandboxError::FileTooLarge(5)));
    assert!(!fs.base_dir().join("large.py").exists());

    fs::write(fs.base_dir().join("big.py"), "123456").unwrap();
    let err = fs.read_file("big.py").unwrap_err();
    assert!(matches!(err, SandboxError::FileTooLarge(6)));
}

#[test]
fn read_errors_are_classified() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs::write(fs.base_dir().join("binary.py"), [0xff, 0xfe, 0x00]).unwrap();
    fs::create_dir(fs.base_dir().join("pkg")).unwrap();

    assert!(matches!(
        fs.read_file("absent.py").unwrap_err(),
        SandboxError::NotFound(_)
    ));
    assert!(matches!(
        fs.read_file("binary.py").unwrap_err(),
        SandboxError::Decode(_)
    ));
    assert!(matches!(
        fs.read_file("pkg").unwrap_err(),
        SandboxError::InvalidOperation(_)
    ));
}

#[test]
fn backup_directory_is_not_writable() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);

    let err = fs
        .write_file(".backups/forged_20240101_000000_000000.py", "x", false)
        .unwrap_err();
    assert!(matches!(err, SandboxError::ReservedPath(_)));
}

#[test]
fn failed_backup_leaves_file_untouched() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs.write_file("module.py", "keep me\n", false).unwrap();

    // A plain file where the backup directory should be makes snapshots fail.
    let backup_dir = fs.backups().backup_dir().to_path_buf();
    fs::remove_dir_all(&backup_dir).unwrap();
    fs::write(&backup_dir, "in the way").unwrap();

    let err = fs.write_file("module.py", "replaced\n", true).unwrap_err();
    match err {
        SandboxError::WriteFailure(message) => assert!(message.contains("file left unchanged")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fs.read_file("module.py").unwrap().content, "keep me\n");
}

#[test]
fn list_files_matches_names_and_skips_backups() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs.write_file("main.py", "", false).unwrap();
    fs.write_file("pkg/util.py", "", false).unwrap();
    fs.write_file("pkg/test_util.py", "", false).unwrap();
    fs.write_file("README.md", "", false).unwrap();
    fs.write_file("main.py", "x = 1\n", true).unwrap();

    let listing = fs.list_files("*.py").unwrap();
    assert_eq!(listing.files, ["main.py", "pkg/test_util.py", "pkg/util.py"]);
    assert_eq!(listing.count, 3);
    assert_eq!(listing.pattern, "*.py");

    let nested = fs.list_files("pkg/test_*.py").unwrap();
    assert_eq!(nested.files, ["pkg/test_util.py"]);

    let everything = fs.list_files("").unwrap();
    assert_eq!(everything.count, 4);

    let err = fs.list_files("[unclosed").unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
}

#[test]
fn file_info_reports_missing_files_without_failing() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs.write_file("module.py", "a\nb\nc\n", false).unwrap();

    let info = fs.file_info("module.py").unwrap();
    assert!(info.exists);
    assert_eq!(info.lines, 3);
    assert_eq!(info.size_bytes, 6);
    assert!(info.modified.is_some());

    let missing = fs.file_info("absent.py").unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.size_bytes, 0);
}

#[test]
fn validate_target_dir_counts_files() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs.write_file("project/app.py", "", false).unwrap();
    fs.write_file("project/test_app.py", "", false).unwrap();
    fs.write_file("project/app_test.py", "", false).unwrap();
    fs.write_file("project/notes.txt", "", false).unwrap();
    fs.write_file("project/app.py", "x = 1\n", true).unwrap();

    let validation = fs.validate_target_dir("project").unwrap();
    assert!(validation.valid);
    assert_eq!(validation.relative_path.as_deref(), Some("project"));
    let counts = validation.file_counts.unwrap();
    assert_eq!(counts.python_files, 3);
    assert_eq!(counts.test_files, 2);
    assert_eq!(counts.other_files, 1);
    assert_eq!(counts.backups, 1);

    let missing = fs.validate_target_dir("nowhere").unwrap();
    assert!(!missing.valid);
    assert!(missing.error.unwrap().contains("does not exist"));

    let file = fs.validate_target_dir("project/app.py").unwrap();
    assert!(!file.valid);
    assert!(file.error.unwrap().contains("not a directory"));
}

#[test]
fn sandbox_info_summarizes_root() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox(&temp, 512 * 1024);
    fs.write_file("app.py", "", false).unwrap();
    fs.write_file("tests/test_app.py", "", false).unwrap();
    fs.write_file("app.py", "x = 1\n", true).unwrap();

    let info = fs.sandbox_info().unwrap();
    assert_eq!(Path::new(&info.sandbox_path), fs.base_dir());
    assert_eq!(info.python_files, 2);
    assert_eq!(info.test_files, 1);
    assert_eq!(info.backups_available, 1);
}

#[test]
fn concurrent_writes_never_interleave() {
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(sandbox(&temp, 512 * 1024));
    let versions: Vec<String> = (0..8)
        .map(|n| format!("version = {n}\n").repeat(200))
        .collect();

    let handles: Vec<_> = versions
        .iter()
        .cloned()
        .map(|content| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || fs.write_file("shared.py", &content, true).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let last = fs.read_file("shared.py").unwrap().content;
    assert!(versions.contains(&last));
    let backups = fs.backups().list_backups(None).unwrap();
    assert_eq!(backups.len(), versions.len() - 1);
    for entry in backups {
        let content = fs::read_to_string(&entry.path).unwrap();
        assert!(versions.contains(&content), "torn backup {}", entry.name);
    }
}
