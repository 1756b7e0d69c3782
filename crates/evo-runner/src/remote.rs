//! Remote command execution over ssh.
//!
//! Only session setup is bounded by a timeout; commands issued on an open
//! session run for as long as the remote side takes.

use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Result, RunnerError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub trait RemoteTransport {
    /// Opens a session to `address`. Failing to connect is `HostUnreachable`.
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn RemoteSession>>;
}

pub trait RemoteSession {
    fn exec(&mut self, command: &str) -> Result<ExecOutput>;

    fn close(&mut self) {}
}

/// Drives the system `ssh` client in batch mode, one process per command.
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub program: String,
    pub user: Option<String>,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            user: None,
        }
    }
}

impl SshTransport {
    pub fn new(program: impl Into<String>, user: Option<String>) -> Self {
        Self {
            program: program.into(),
            user,
        }
    }

    fn destination(&self, address: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        }
    }
}

/// ssh reserves 255 for its own failures (connect, auth, protocol).
const SSH_FAILURE: i32 = 255;

impl RemoteTransport for SshTransport {
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn RemoteSession>> {
        let mut session = SshSession {
            program: self.program.clone(),
            destination: self.destination(address),
            timeout,
        };
        let check = session
            .exec("true")
            .map_err(|err| RunnerError::HostUnreachable {
                host: address.to_string(),
                reason: err.to_string(),
            })?;
        if check.exit_code != 0 {
            let reason = match check.stderr.trim() {
                "" => format!("ssh exited with {}", check.exit_code),
                msg => msg.to_string(),
            };
            return Err(RunnerError::HostUnreachable {
                host: address.to_string(),
                reason,
            });
        }
        tracing::debug!(host = address, "session established");
        Ok(Box::new(session))
    }
}

struct SshSession {
    program: String,
    destination: String,
    timeout: Duration,
}

impl SshSession {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.timeout.as_secs().max(1)))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(remote);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let output = self
            .command(command)
            .output()
            .map_err(|err| RunnerError::Transport(format!("{}: {}", self.program, err)))?;
        let exit_code = output.status.code().unwrap_or(-1);
        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        };
        if exit_code == SSH_FAILURE {
            return Err(RunnerError::Transport(format!(
                "{}: {}",
                self.destination,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_includes_user_when_configured() {
        let plain = SshTransport::default();
        assert_eq!(plain.destination("gruenau5"), "gruenau5");
        let user = SshTransport::new("ssh", Some("robot".to_string()));
        assert_eq!(user.destination("gruenau5"), "robot@gruenau5");
    }

    #[test]
    fn ssh_command_runs_in_batch_mode_with_timeout() {
        let session = SshSession {
            program: "ssh".to_string(),
            destination: "host".to_string(),
            timeout: Duration::from_millis(200),
        };
        let cmd = session.command("uptime");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-o", "ConnectTimeout=1", "-o", "BatchMode=yes", "host", "uptime"]
        );
    }

    #[test]
    fn missing_client_is_unreachable() {
        let transport = SshTransport::new("/definitely/not/here/ssh", None);
        let err = transport
            .connect("host", Duration::from_secs(1))
            .err()
            .expect("unreachable");
        assert!(matches!(err, RunnerError::HostUnreachable { .. }));
    }
}
