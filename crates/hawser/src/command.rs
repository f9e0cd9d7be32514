//! Command execution over sessions, plus local and host conveniences

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

use crate::cache::HandleCache;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::session::Connection;

/// Escape single quotes for use inside a shell single-quoted string.
///
/// The replacement ends the open quotation, emits a double-quoted quote
/// character, and reopens the single quotation; with no whitespace between
/// the pieces the shell reads the result as one word.
pub fn shell_escape_single_quote(command: &str) -> String {
    command.replace('\'', "'\"'\"'")
}

/// Runs one command over a dedicated session and captures its exit status,
/// stdout and stderr.
///
/// The session is established per run and closed on every exit path. A PTY
/// can be requested before execution with [`RemoteCommand::with_pty`].
pub struct RemoteCommand {
    command: String,
    host: String,
    port: u16,
    username: Option<String>,
    credentials: Credentials,
    cache: Arc<dyn HandleCache>,
    proxy_cmd: Option<String>,
    pty: bool,
}

impl RemoteCommand {
    /// Build a command against `host` using the given cache.
    pub fn new(
        command: impl Into<String>,
        host: impl Into<String>,
        cache: Arc<dyn HandleCache>,
    ) -> Self {
        Self {
            command: command.into(),
            host: host.into(),
            port: 22,
            username: None,
            credentials: Credentials::default(),
            cache,
            proxy_cmd: None,
            pty: false,
        }
    }

    /// Target port (default 22).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Username to authenticate as (default: the local username).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Credential material for transport authentication.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Proxy command overriding the user's SSH configuration.
    pub fn proxy_command(mut self, proxy_cmd: impl Into<String>) -> Self {
        self.proxy_cmd = Some(proxy_cmd.into());
        self
    }

    /// Allocate a PTY before executing the command.
    pub fn with_pty(mut self) -> Self {
        self.pty = true;
        self
    }

    /// Run the command; return exit status, stdout and stderr.
    pub async fn run_status_stderr(&self) -> Result<(i32, String, String)> {
        let mut session = Connection::open(
            &self.host,
            self.port,
            self.username.as_deref(),
            &self.credentials,
            Arc::clone(&self.cache),
            self.proxy_cmd.as_deref(),
        )
        .await?;

        let result = self.drive(&mut session).await;
        // The session is closed whether the drain succeeded or failed.
        let closed = session.close().await;
        let (status, stdout, stderr) = result?;
        closed?;
        Ok((status, stdout, stderr))
    }

    async fn drive(&self, session: &mut Connection) -> Result<(i32, String, String)> {
        if self.pty {
            let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());
            session.request_pty(&term, 80, 24).await?;
        }
        debug!(host = %self.host, command = %self.command, "executing remote command");
        session.exec(&self.command).await?;
        session.wait_close().await?;

        let status = session.exit_status().map(|s| s as i32).unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&session.take_stdout()).into_owned();
        let stderr = String::from_utf8_lossy(&session.take_stderr()).into_owned();
        Ok((status, stdout, stderr))
    }

    /// Run the command; return stdout and stderr, failing on non-zero exit.
    pub async fn run_stderr(&self) -> Result<(String, String)> {
        let (status, stdout, stderr) = self.run_status_stderr().await?;
        if status != 0 {
            return Err(Error::CommandFailed {
                status,
                command: self.command.clone(),
                output: if stderr.is_empty() {
                    stdout
                } else {
                    stderr
                },
            });
        }
        Ok((stdout, stderr))
    }

    /// Run the command; return exit status and stdout.
    pub async fn run_status(&self) -> Result<(i32, String)> {
        let (status, stdout, _) = self.run_status_stderr().await?;
        Ok((status, stdout))
    }

    /// Run the command; return stdout, failing on non-zero exit.
    pub async fn run(&self) -> Result<String> {
        Ok(self.run_stderr().await?.0)
    }
}

/// Runs one command locally through `/bin/sh -c` with the same surface as
/// [`RemoteCommand`].
pub struct LocalCommand {
    command: String,
}

impl LocalCommand {
    /// Build a local command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Run the command; return exit status, stdout and stderr.
    pub async fn run_status_stderr(&self) -> Result<(i32, String, String)> {
        debug!(command = %self.command, "executing local command");
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// Run the command; return stdout and stderr, failing on non-zero exit.
    pub async fn run_stderr(&self) -> Result<(String, String)> {
        let (status, stdout, stderr) = self.run_status_stderr().await?;
        if status != 0 {
            return Err(Error::CommandFailed {
                status,
                command: self.command.clone(),
                output: if stderr.is_empty() {
                    stdout
                } else {
                    stderr
                },
            });
        }
        Ok((stdout, stderr))
    }

    /// Run the command; return exit status and stdout.
    pub async fn run_status(&self) -> Result<(i32, String)> {
        let (status, stdout, _) = self.run_status_stderr().await?;
        Ok((status, stdout))
    }

    /// Run the command; return stdout, failing on non-zero exit.
    pub async fn run(&self) -> Result<String> {
        Ok(self.run_stderr().await?.0)
    }
}

enum HostTarget {
    Local,
    Remote {
        host: String,
        port: u16,
        username: Option<String>,
        credentials: Credentials,
        cache: Arc<dyn HandleCache>,
    },
}

/// Easy command access to one local or remote host, anchored to a working
/// directory.
pub struct Host {
    target: HostTarget,
    cwd: String,
}

impl Host {
    /// A host wrapping the local machine, anchored to the current working
    /// directory unless `cwd` is given.
    pub async fn local(cwd: Option<String>) -> Result<Self> {
        let cwd = match cwd {
            Some(cwd) => cwd,
            None => LocalCommand::new("pwd").run().await?.trim().to_string(),
        };
        Ok(Self {
            target: HostTarget::Local,
            cwd,
        })
    }

    /// A host reached over SSH. Commands run through `cache`, which the
    /// caller can share with other hosts to pool transports.
    pub async fn remote(
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        credentials: Credentials,
        cache: Arc<dyn HandleCache>,
        cwd: Option<String>,
    ) -> Result<Self> {
        let target = HostTarget::Remote {
            host: host.into(),
            port,
            username,
            credentials,
            cache,
        };
        let mut this = Self {
            target,
            cwd: String::new(),
        };
        this.cwd = match cwd {
            Some(cwd) => cwd,
            None => this.run("pwd").await?.trim().to_string(),
        };
        Ok(this)
    }

    /// Working directory commands are anchored to.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    fn wrap(&self, command: &str) -> String {
        if self.cwd.is_empty() {
            return command.to_string();
        }
        format!(
            "bash -c 'cd {} && {}'",
            self.cwd,
            shell_escape_single_quote(command)
        )
    }

    /// Run a command on the host; return exit status, stdout and stderr.
    pub async fn run_status_stderr(&self, command: &str) -> Result<(i32, String, String)> {
        let wrapped = self.wrap(command);
        match &self.target {
            HostTarget::Local => LocalCommand::new(wrapped).run_status_stderr().await,
            HostTarget::Remote {
                host,
                port,
                username,
                credentials,
                cache,
            } => {
                let mut cmd = RemoteCommand::new(wrapped, host.clone(), Arc::clone(cache))
                    .port(*port)
                    .credentials(credentials.clone());
                if let Some(username) = username {
                    cmd = cmd.username(username.clone());
                }
                cmd.run_status_stderr().await
            }
        }
    }

    /// Run a command; return exit status and stdout.
    pub async fn run_status(&self, command: &str) -> Result<(i32, String)> {
        let (status, stdout, _) = self.run_status_stderr(command).await?;
        Ok((status, stdout))
    }

    /// Run a command; return stdout and stderr, failing on non-zero exit.
    pub async fn run_stderr(&self, command: &str) -> Result<(String, String)> {
        let (status, stdout, stderr) = self.run_status_stderr(command).await?;
        if status != 0 {
            return Err(Error::CommandFailed {
                status,
                command: command.to_string(),
                output: if stderr.is_empty() {
                    stdout
                } else {
                    stderr
                },
            });
        }
        Ok((stdout, stderr))
    }

    /// Run a command; return stdout, failing on non-zero exit.
    pub async fn run(&self, command: &str) -> Result<String> {
        Ok(self.run_stderr(command).await?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape_single_quote() {
        assert_eq!(shell_escape_single_quote("plain"), "plain");
        assert_eq!(
            shell_escape_single_quote("it's here"),
            "it'\"'\"'s here"
        );
    }

    #[tokio::test]
    async fn test_local_command_captures_stdout() {
        let (status, stdout) = LocalCommand::new("echo hello")
            .run_status()
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_local_command_nonzero_exit_raises() {
        let err = LocalCommand::new("ls /definitely-not-here-42")
            .run()
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { status, output, .. } => {
                assert_ne!(status, 0);
                assert!(!output.is_empty());
            }
            other => panic!("expected command failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_local_command_stderr_separate_from_stdout() {
        let (status, stdout, stderr) = LocalCommand::new("echo out; echo err >&2")
            .run_status_stderr()
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(stdout.trim(), "out");
        assert_eq!(stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_local_host_anchors_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::local(Some(dir.path().display().to_string()))
            .await
            .unwrap();
        let output = host.run("pwd").await.unwrap();
        // Canonicalize both sides; the tempdir may sit behind a symlink.
        let reported = std::fs::canonicalize(output.trim()).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn test_local_host_default_cwd_is_discovered() {
        let host = Host::local(None).await.unwrap();
        assert!(!host.cwd().is_empty());
    }
}
