use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::errors::{Result, SandboxError};

// How long readers may keep draining pipes once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// An external tool invocation template: program, leading args, time bound.
#[derive(Clone, Debug)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Result<Self> {
        let program = program.into().trim().to_string();
        if program.is_empty() {
            return Err(SandboxError::InvalidOperation(
                "tool program must not be empty".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(SandboxError::InvalidOperation(format!(
                "timeout for '{program}' must be greater than zero"
            )));
        }
        let args = args
            .into_iter()
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect();
        Ok(Self {
            program,
            args,
            timeout,
        })
    }

    /// A bare program with no leading args.
    pub(crate) fn program_only(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Splits a command line such as `python3 -m pytest` on whitespace.
    pub fn parse(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            SandboxError::InvalidOperation("tool command line must not be empty".to_string())
        })?;
        Self::new(program, parts, timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A request for this tool with `extra` appended after the leading args.
    pub fn request(&self, extra: impl IntoIterator<Item = String>) -> RunRequest {
        let mut args = self.args.clone();
        args.extend(extra);
        RunRequest::new(&self.program)
            .with_args(args)
            .with_timeout(self.timeout)
    }
}

/// Finds `program` on `PATH`, or checks it directly when it contains a `/`.
pub fn detect_binary(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl RunOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs a process to completion or until its timeout fires.
///
/// On timeout the child is killed and reaped, and whatever it had written so
/// far is returned inside [`SandboxError::Timeout`].
#[instrument(skip(request), fields(program = %request.program))]
pub async fn execute(request: RunRequest) -> Result<RunOutput> {
    let RunRequest {
        program,
        args,
        env,
        working_dir,
        timeout: limit,
    } = request;

    if limit.is_zero() {
        return Err(SandboxError::InvalidOperation(
            "timeout must be greater than zero".to_string(),
        ));
    }

    let mut command = Command::new(&program);
    if let Some(dir) = &working_dir {
        if !dir.is_dir() {
            return Err(SandboxError::InvalidOperation(format!(
                "working directory '{}' is not a directory",
                dir.display()
            )));
        }
        command.current_dir(dir);
    }
    command.kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }
    command.args(&args);

    let mut child = command.spawn().map_err(|err| {
        SandboxError::ToolExecution(format!("could not start '{program}': {err}"))
    })?;

    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));
    let stdout_reader = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stdout))));
    let stderr_reader = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stderr))));

    let start = Instant::now();
    let status = match timeout(limit, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            warn!(?limit, "process timed out, killing it");
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // The child leads its own group; take any helpers it spawned down too.
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                }
            }
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill timed out process");
            }
            None
        }
    };
    let duration = start.elapsed();

    finish(stdout_reader).await;
    finish(stderr_reader).await;
    let stdout = std::mem::take(&mut *stdout.lock());
    let stderr = std::mem::take(&mut *stderr.lock());

    match status {
        Some(status) => Ok(RunOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration,
        }),
        None => {
            let mut partial_output = String::from_utf8_lossy(&stdout).into_owned();
            if !stderr.is_empty() {
                partial_output.push('\n');
                partial_output.push_str(&String::from_utf8_lossy(&stderr));
            }
            Err(SandboxError::Timeout {
                limit,
                partial_output,
            })
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0_u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => sink.lock().extend_from_slice(&chunk[..read]),
        }
    }
}

// A grandchild can keep a pipe open after the child exits; stop waiting then.
async fn finish(reader: Option<JoinHandle<()>>) {
    if let Some(mut handle) = reader {
        if timeout(DRAIN_GRACE, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}
