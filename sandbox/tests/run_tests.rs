use std::time::{Duration, Instant};

use sandbox::run::{execute, RunRequest, ToolCommand};
use sandbox::SandboxError;
use tempfile::TempDir;

fn shell(script: &str) -> RunRequest {
    RunRequest::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
}

#[tokio::test]
async fn captures_exit_code_and_both_streams() {
    let temp = TempDir::new().unwrap();

    let request = shell("printf 'hello world'; printf 'oops' >&2; exit 3")
        .with_working_dir(temp.path())
        .with_timeout(Duration::from_secs(5));
    let output = execute(request).await.expect("command runs");
    assert_eq!(output.exit_code, Some(3));
    assert_eq!(output.stdout, b"hello world");
    assert_eq!(output.stderr_text(), "oops");
}

#[tokio::test]
async fn runs_in_working_directory_with_env() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("marker.txt"), "here").unwrap();

    let request = shell("cat marker.txt; printf \" $GREETING\"")
        .with_working_dir(temp.path())
        .with_env(vec![("GREETING".to_string(), "ready".to_string())])
        .with_timeout(Duration::from_secs(5));
    let output = execute(request).await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout_text(), "here ready");
}

#[tokio::test]
async fn enforces_timeout_and_keeps_partial_output() {
    let request = shell("echo partial; sleep 5").with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = execute(request).await.expect_err("timeout expected");
    assert!(started.elapsed() < Duration::from_secs(4));
    match err {
        SandboxError::Timeout {
            limit,
            partial_output,
        } => {
            assert_eq!(limit, Duration::from_millis(300));
            assert!(partial_output.contains("partial"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_program_is_a_tool_execution_error() {
    let request = RunRequest::new("definitely-not-a-real-tool-7c1f").with_timeout(Duration::from_secs(1));

    let err = execute(request).await.expect_err("spawn should fail");
    match err {
        SandboxError::ToolExecution(message) => {
            assert!(message.contains("definitely-not-a-real-tool-7c1f"))
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rejects_zero_timeout_and_missing_working_dir() {
    let err = execute(shell("true").with_timeout(Duration::ZERO))
        .await
        .expect_err("zero timeout rejected");
    assert!(matches!(err, SandboxError::InvalidOperation(_)));

    let temp = TempDir::new().unwrap();
    let err = execute(shell("true").with_working_dir(temp.path().join("missing")))
        .await
        .expect_err("missing dir rejected");
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
}

#[test]
fn tool_command_parses_command_lines() {
    let command = ToolCommand::parse("  python3 -m   pytest ", Duration::from_secs(60)).unwrap();
    assert_eq!(command.program(), "python3");
    assert_eq!(command.args(), ["-m", "pytest"]);
    assert_eq!(command.timeout(), Duration::from_secs(60));

    let request = command.request(vec!["tests".to_string()]);
    assert_eq!(request.program, "python3");
    assert_eq!(request.args, ["-m", "pytest", "tests"]);
    assert_eq!(request.timeout, Duration::from_secs(60));

    assert!(ToolCommand::parse("   ", Duration::from_secs(1)).is_err());
    assert!(ToolCommand::parse("pylint", Duration::ZERO).is_err());
}
