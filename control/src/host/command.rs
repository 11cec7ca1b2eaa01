//! External command execution
//!
//! Host programming shells out to `ip`, `iptables` and `ovs-ofctl`. All of it
//! goes through `CommandRunner` so adapters can be tested against a scripted
//! runner.

use crate::error::HostError;
use std::process::Command;
use tracing::debug;

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program to completion
///
/// A non-zero exit is reported in `CommandOutput::success`, not as an error;
/// `Err` means the program could not be started at all.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError>;
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        debug!(command = %command_line(program, args), "Running host command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| HostError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Program and arguments joined for logs and error messages
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a command and turn a non-zero exit into `HostError::CommandFailed`
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<String, HostError> {
    let output = runner.run(program, args)?;
    if !output.success {
        return Err(HostError::CommandFailed {
            command: command_line(program, args),
            stderr: output.stderr,
        });
    }
    Ok(output.stdout)
}

/// Build an owned argument list from string slices
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[test]
    fn test_run_checked_reports_stderr() {
        let runner = ScriptedRunner::new();
        runner.on("ip addr add", CommandOutput::failed("RTNETLINK answers: Permission denied"));

        let err = run_checked(&runner, "ip", &args(["addr", "add", "10.0.0.1/24"]))
            .expect_err("Non-zero exit must fail");

        assert_eq!(
            err.to_string(),
            "`ip addr add 10.0.0.1/24` failed: RTNETLINK answers: Permission denied"
        );
    }

    #[test]
    fn test_run_checked_returns_stdout() {
        let runner = ScriptedRunner::new();
        runner.on("echo", CommandOutput::ok("hello\n"));

        assert_eq!(run_checked(&runner, "echo", &[]).unwrap(), "hello\n");
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run("definitely-not-a-real-program-egress", &[])
            .expect_err("Missing binary must fail to spawn");
        assert!(matches!(err, HostError::Spawn { .. }));
    }
}
