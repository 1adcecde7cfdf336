//! External tool wrappers
//!
//! Each submodule builds a `Command` (exposed as `build_*` so tests can
//! inspect it) and a `run_*`/verb function that executes it synchronously.
//! Callers run these inside `spawn_blocking`.

pub mod fetch;
pub mod ffmpeg;
pub mod mkvextract;
pub mod mkvmerge;
pub mod ocr;
pub mod resync;

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};
use thiserror::Error;

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The program exited with a failure code
    #[error("{tool} failed with exit code {code}\n  command: {command}\n  stderr: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        command: String,
        stderr: String,
    },

    /// The program was killed by a signal
    #[error("{tool} was terminated by a signal\n  command: {command}")]
    Terminated { tool: String, command: String },

    /// The program succeeded but produced something unusable
    #[error("{tool} produced unusable output: {reason}")]
    Output { tool: String, reason: String },
}

/// Render a command line for logs and error messages
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            parts.push(format!("'{}'", arg));
        } else {
            parts.push(arg.into_owned());
        }
    }
    parts.join(" ")
}

/// Exit code of a finished process; `128 + signal` when killed
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Run `cmd` to completion, capturing its output.
///
/// Exit codes listed in `ok_codes` count as success in addition to 0.
pub fn run_checked(cmd: &mut Command, tool: &str, ok_codes: &[i32]) -> Result<Output, ToolError> {
    let command = describe(cmd);
    tracing::debug!(tool, %command, "Running");

    let output = cmd.output().map_err(|source| ToolError::Launch {
        tool: tool.to_string(),
        source,
    })?;

    match output.status.code() {
        Some(0) => Ok(output),
        Some(code) if ok_codes.contains(&code) => {
            tracing::warn!(
                tool,
                code,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "Finished with warnings"
            );
            Ok(output)
        }
        Some(code) => Err(ToolError::Failed {
            tool: tool.to_string(),
            code,
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        None => Err(ToolError::Terminated {
            tool: tool.to_string(),
            command,
        }),
    }
}

/// Shell scripts standing in for the external tools
#[cfg(test)]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable `/bin/sh` script named `name` into `dir`
    pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Display server that only creates its socket and idles
    pub fn display_server(dir: &Path) -> PathBuf {
        script(
            dir,
            "Xvfb",
            "n=\"${1#:}\"\nmkdir -p /tmp/.X11-unix\ntouch \"/tmp/.X11-unix/X$n\"\nexec sleep 30",
        )
    }

    /// Remove the sockets `display_server` left for `ids`
    pub fn remove_sockets(ids: std::ops::Range<u32>) {
        for id in ids {
            let _ = std::fs::remove_file(format!("/tmp/.X11-unix/X{}", id));
        }
    }

    pub fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}
