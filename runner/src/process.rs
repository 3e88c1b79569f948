use std::{
    io::{self, Read, Write},
    os::unix::process::ExitStatusExt,
    process::{Command, ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Empty command line")]
    EmptyCommand,
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Failed to communicate with `{command}`: {source}")]
    Io { command: String, source: io::Error },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// container for the result of a finished child process
#[derive(Debug, Clone)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// build a command from a configured command line, e.g. `["srun", "dmtcp_launch"]`
pub fn command_line(parts: &[String]) -> Result<Command, ProcessError> {
    let (program, args) = parts.split_first().ok_or(ProcessError::EmptyCommand)?;
    let mut command = Command::new(program);
    command.args(args);

    Ok(command)
}

/// exit code of a finished process, signals are mapped to 128 + signal like a shell does
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

fn describe(command: &Command) -> String {
    format!("{command:?}")
}

/// run a short lived command to completion, feeding `stdin` and capturing its output
pub fn run_captured(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<Output, ProcessError> {
    let description = describe(&command);
    let io_error = |source: io::Error| ProcessError::Io {
        command: description.clone(),
        source,
    };

    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: description.clone(),
            source,
        })?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(error) = pipe.write_all(bytes) {
            let _ = child.kill();
            let _ = child.wait();

            return Err(io_error(error));
        }
        // Dropping stdin here closes the file descriptor, the child sees the end of its input
        drop(pipe);
    }

    debug!("Waiting on {} ({description})", child.id());
    let status = match child.wait_timeout(timeout).map_err(io_error)? {
        Some(status) => status,
        None => {
            warn!("{description} ran into timeout, killing it");
            let _ = child.kill();
            let _ = child.wait();

            return Err(ProcessError::Timeout {
                command: description.clone(),
                timeout,
            });
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();

    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout).map_err(io_error)?;
    }
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr).map_err(io_error)?;
    }

    Ok(Output {
        status: exit_code(status),
        stdout,
        stderr,
    })
}

/// run a long running command with inherited stdio and return its exit code
pub fn run_inherited(mut command: Command) -> Result<i32, ProcessError> {
    let description = describe(&command);
    debug!("Running {description}");

    let status = command.status().map_err(|source| ProcessError::Spawn {
        command: description,
        source,
    })?;

    Ok(exit_code(status))
}
