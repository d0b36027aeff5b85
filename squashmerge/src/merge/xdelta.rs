// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fs::File,
    io,
    path::Path,
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to redirect {0} for child process")]
    Redirect(&'static str, #[source] io::Error),
    #[error("Failed to spawn command: {0}")]
    Spawn(String, #[source] io::Error),
    #[error("Failed to wait for command: {0}")]
    Wait(String, #[source] io::Error),
    #[error("Child exited with non-success status: {1}: {0}")]
    ExitStatus(String, ExitStatus),
}

type Result<T> = std::result::Result<T, Error>;

/// Run `xdelta3 -c -d -s <source_path>` with stdin reading from `patch` and
/// stdout writing to `output`. Both handles are used from their current file
/// positions. Blocks until the child exits.
pub fn run_xdelta3(program: &OsStr, patch: &File, output: &File, source_path: &Path) -> Result<()> {
    let stdin = patch
        .try_clone()
        .map_err(|e| Error::Redirect("stdin", e))?;
    let stdout = output
        .try_clone()
        .map_err(|e| Error::Redirect("stdout", e))?;

    let mut command = Command::new(program);
    command.args(["-c", "-d", "-s"]);
    command.arg(source_path);
    command.stdin(Stdio::from(stdin));
    command.stdout(Stdio::from(stdout));
    command.stderr(Stdio::inherit());

    let command_str = format!("{command:?}");
    debug!("Running: {command_str}");

    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(command_str.clone(), e))?;
    let status = child
        .wait()
        .map_err(|e| Error::Wait(command_str.clone(), e))?;

    if !status.success() {
        return Err(Error::ExitStatus(command_str, status));
    }

    Ok(())
}
