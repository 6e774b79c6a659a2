// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Guarded remote command execution

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use tracing::{error, info, warn};

use ssh_gateway_common::{GatewayError, Result};

use super::remote::{ExecEvent, RemoteFs};

/// A shell command built from individually quoted arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    cwd: Option<String>,
    argv: Vec<String>,
}

fn quote(arg: &str) -> Result<String> {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        .map_err(|_| GatewayError::Validation(format!("Argument contains a NUL byte: {:?}", arg)))
}

/// Paths that begin with `-` would be parsed as options
pub fn path_arg(path: &str) -> String {
    if path.starts_with('-') {
        format!("./{}", path)
    } else {
        path.to_string()
    }
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            cwd: None,
            argv: vec![program.to_string()],
        }
    }

    /// Run from `dir` (`cd <dir> && ...`)
    pub fn in_dir(mut self, dir: &str) -> Result<Self> {
        self.cwd = Some(quote(&path_arg(dir))?);
        Ok(self)
    }

    pub fn arg(mut self, arg: &str) -> Result<Self> {
        self.argv.push(quote(arg)?);
        Ok(self)
    }

    pub fn args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg.as_ref())?;
        }
        Ok(self)
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cwd) = &self.cwd {
            write!(f, "cd {} && ", cwd)?;
        }
        f.write_str(&self.argv.join(" "))
    }
}

/// Run a command to completion.
///
/// Fails if the transport is down, on timeout, on a non-zero exit (with the
/// captured stderr), on a stream error, or when the stream ends without an
/// exit status. Stdout is drained and discarded.
pub async fn guarded_exec<R: RemoteFs + ?Sized>(
    remote: &R,
    command: &RemoteCommand,
    timeout: Duration,
) -> Result<()> {
    let cmd = command.to_string();

    if !remote.is_alive() {
        return Err(GatewayError::Connection(
            "SSH connection is closed".to_string(),
        ));
    }

    let run = async {
        let mut events = remote.spawn_exec(&cmd).await?;
        let mut stderr = Vec::new();

        while let Some(event) = events.next().await {
            match event {
                ExecEvent::Stdout(_) => {}
                ExecEvent::Stderr(data) => stderr.extend_from_slice(&data),
                ExecEvent::Exit(0) => return Ok(()),
                ExecEvent::Exit(code) => {
                    let message = String::from_utf8_lossy(&stderr).trim().to_string();
                    return Err(GatewayError::RemoteExec(if message.is_empty() {
                        format!("Command exited with code {}", code)
                    } else {
                        message
                    }));
                }
                ExecEvent::Error(e) => return Err(GatewayError::RemoteExec(e)),
            }
        }

        let message = String::from_utf8_lossy(&stderr).trim().to_string();
        Err::<(), _>(GatewayError::RemoteExec(if message.is_empty() {
            "Command channel closed without an exit status".to_string()
        } else {
            message
        }))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(())) => {
            info!("Command succeeded: {}", cmd);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Command failed: {}: {}", cmd, e);
            Err(e)
        }
        Err(_) => {
            warn!("Command timed out: {}", cmd);
            Err(GatewayError::Timeout {
                command: cmd,
                seconds: timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::mock::{MockRemote, Script};

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_command_quotes_every_argument() {
        let cmd = RemoteCommand::new("tar")
            .in_dir("/srv/my data")
            .unwrap()
            .args(["-czf", "/tmp/t.tar.gz", "./it's", "./$(reboot)"])
            .unwrap();
        let rendered = cmd.to_string();
        assert!(rendered.starts_with("cd '/srv/my data' && tar -czf /tmp/t.tar.gz "));
        assert!(!rendered.contains(" ./$(reboot)"));
        assert_eq!(shlex::split(&rendered[rendered.find("tar").unwrap()..]).unwrap(), vec![
            "tar", "-czf", "/tmp/t.tar.gz", "./it's", "./$(reboot)"
        ]);
    }

    #[test]
    fn test_nul_argument_rejected() {
        let err = RemoteCommand::new("touch").arg("a\0b").unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_path_arg_guards_leading_dash() {
        assert_eq!(path_arg("-rf"), "./-rf");
        assert_eq!(path_arg("/tmp/x"), "/tmp/x");
    }

    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        let remote = MockRemote::new();
        remote.script(Script::Events(vec![
            ExecEvent::Stdout(b"noise".to_vec()),
            ExecEvent::Exit(0),
        ]));
        guarded_exec(&remote, &RemoteCommand::new("true"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(remote.commands(), vec!["true"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let remote = MockRemote::new();
        remote.script(Script::Events(vec![
            ExecEvent::Stderr(b"cp: cannot stat 'x': No such file\n".to_vec()),
            ExecEvent::Exit(1),
        ]));
        let err = guarded_exec(&remote, &RemoteCommand::new("cp"), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cp: cannot stat 'x': No such file");

        remote.script(Script::Events(vec![ExecEvent::Exit(2)]));
        let err = guarded_exec(&remote, &RemoteCommand::new("false"), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command exited with code 2");
    }

    #[tokio::test]
    async fn test_stream_end_without_exit_is_failure() {
        let remote = MockRemote::new();
        remote.script(Script::Events(vec![ExecEvent::Stdout(b"partial".to_vec())]));
        let err = guarded_exec(&remote, &RemoteCommand::new("x"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RemoteExec(_)));
    }

    #[tokio::test]
    async fn test_stream_error_fails_command() {
        let remote = MockRemote::new();
        remote.script(Script::Events(vec![
            ExecEvent::Stderr(b"ignored".to_vec()),
            ExecEvent::Error("channel reset by peer".into()),
            ExecEvent::Exit(0),
        ]));
        let err = guarded_exec(&remote, &RemoteCommand::new("tar"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(&err, GatewayError::RemoteExec(m) if m == "channel reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_command_times_out() {
        let remote = MockRemote::new();
        remote.script(Script::Hang);
        let err = guarded_exec(&remote, &RemoteCommand::new("sleep").arg("100").unwrap(), TIMEOUT)
            .await
            .unwrap_err();
        match err {
            GatewayError::Timeout { command, seconds } => {
                assert_eq!(command, "sleep 100");
                assert_eq!(seconds, 30);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_transport_is_rejected_before_exec() {
        let remote = MockRemote::new();
        remote.set_alive(false);
        let err = guarded_exec(&remote, &RemoteCommand::new("true"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(remote.commands().is_empty());
    }
}
