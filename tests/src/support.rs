use std::env;
use std::fs;
use std::time::Duration;

use anyhow::Result;
use sandbox::{ToolCommand, Toolbox, ToolboxConfig};
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

pub fn system_path() -> String {
    env::var("PATH").unwrap_or_else(|_| {
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
    })
}

/// A toolbox rooted at `<workspace>/sandbox`.
pub fn toolbox_in(workspace: &TempDir) -> Result<Toolbox> {
    Ok(Toolbox::new(ToolboxConfig::new(
        workspace.path().join("sandbox"),
    ))?)
}

/// A shell script standing in for an external tool, run through `/bin/sh`.
pub fn scripted_tool(
    workspace: &TempDir,
    name: &str,
    script: &str,
    timeout: Duration,
) -> Result<ToolCommand> {
    let dir = workspace.path().join("tools");
    fs::create_dir_all(&dir)?;
    let path = dir.join(name);
    fs::write(&path, script)?;
    Ok(ToolCommand::new(
        "/bin/sh",
        vec![path.display().to_string()],
        timeout,
    )?)
}
