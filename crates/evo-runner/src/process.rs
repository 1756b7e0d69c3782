use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::error::{Result, RunnerError};

/// A fully resolved command line for the simulation binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// The simulation binary; checked for presence before spawning.
    pub binary: PathBuf,
    /// What actually gets executed, usually `nice` wrapping `binary`.
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an invocation to completion and captures its output.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;

    /// Fails before anything is touched when `invocation` cannot be run.
    fn preflight(&self, _invocation: &Invocation) -> Result<()> {
        Ok(())
    }

    /// Runs with the terminal attached (viewer windows, interactive output)
    /// and returns only the exit code.
    fn run_attached(&self, invocation: &Invocation) -> Result<i32> {
        self.run(invocation).map(|output| output.exit_code)
    }
}

/// Spawns the binary on this machine and blocks until it exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

impl LocalRunner {
    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn exit_code_of(status: std::process::ExitStatus, invocation: &Invocation) -> i32 {
    match status.code() {
        Some(code) => code,
        None => {
            tracing::warn!(command = %invocation.command_line(), "terminated by signal");
            -1
        }
    }
}

impl CommandRunner for LocalRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.preflight(invocation)?;
        let mut cmd = Self::command(invocation);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output()?;
        Ok(ProcessOutput {
            exit_code: exit_code_of(output.status, invocation),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn preflight(&self, invocation: &Invocation) -> Result<()> {
        if invocation.binary.is_file() {
            Ok(())
        } else {
            Err(RunnerError::BinaryMissing(invocation.binary.clone()))
        }
    }

    fn run_attached(&self, invocation: &Invocation) -> Result<i32> {
        self.preflight(invocation)?;
        let status = Self::command(invocation).status()?;
        Ok(exit_code_of(status, invocation))
    }
}

/// Removes terminal color sequences (`ESC ... m`).
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('\x1b') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        match tail.find('m') {
            Some(end) => rest = &tail[end + 1..],
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
