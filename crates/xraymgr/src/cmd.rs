//! Subprocess helpers shared by the slot controller and the counter reader.

use std::ffi::OsStr;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("failed to execute `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` timed out after {}s", timeout.as_secs_f32())]
    Timeout { cmd: String, timeout: Duration },

    #[error("`{cmd}` failed ({status}): {stderr}")]
    Failed {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

fn cmd_line<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run a command to completion with an upper bound, capturing its output.
///
/// Logs the full command line at debug level. A non-zero exit is not an
/// error here; see [`run_checked`].
pub async fn run_output<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> Result<Output, CmdError> {
    let program = program.as_ref();
    let cmd = cmd_line(program, args);
    tracing::debug!("exec: {cmd}");

    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(CmdError::Spawn { cmd, source }),
        Err(_) => Err(CmdError::Timeout { cmd, timeout }),
    }
}

/// Run a command and fail on non-zero exit. Logs `description` at info level.
pub async fn run_checked<S: AsRef<OsStr>>(
    description: &str,
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> Result<Output, CmdError> {
    tracing::info!("{description}");
    let program = program.as_ref();
    let output = run_output(program, args, timeout).await?;

    if !output.status.success() {
        let cmd = cmd_line(program, args);
        let stderr = combined_output(&output);
        tracing::error!("command failed: {cmd}\nstderr: {stderr}");
        return Err(CmdError::Failed {
            cmd,
            status: output.status,
            stderr,
        });
    }
    Ok(output)
}

/// Stderr if present, otherwise stdout, trimmed.
pub fn combined_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}
