//! Raw socket resolution and proxy-command transports

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::config::UserSshConfig;
use crate::error::{Error, Result};

/// A connected raw transport: either a TCP socket or the stdio of a proxy
/// command standing in for one.
#[derive(Debug)]
pub enum SocketStream {
    /// Direct TCP connection.
    Tcp(TcpStream),
    /// Proxy command subprocess bridging to the target.
    Proxy(ProxyStream),
}

/// Duplex stream over a proxy command's stdin/stdout.
///
/// The subprocess is killed when the stream is dropped.
#[derive(Debug)]
pub struct ProxyStream {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProxyStream {
    fn spawn(command_line: &str) -> Result<Self> {
        debug!(command = command_line, "starting proxy command");
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("proxy command stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("proxy command stdout unavailable"))?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

impl Drop for ProxyStream {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            SocketStream::Proxy(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            SocketStream::Proxy(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            SocketStream::Proxy(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            SocketStream::Proxy(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Substitute the `%h` and `%p` placeholders of a proxy command line.
pub fn substitute_proxy_tokens(command: &str, host: &str, port: u16) -> String {
    command
        .replace("%h", host)
        .replace("%p", &port.to_string())
}

/// Open a raw transport to `host:port`.
///
/// When `use_config` is set, the user's SSH configuration is consulted for
/// host/port remapping and a proxy command. An explicit `proxy_cmd` argument
/// takes precedence over a configured one. Without a proxy, every resolved
/// address is attempted in order and the first successful connect wins; when
/// all attempts fail the last error is reported.
pub async fn open_socket(
    host: &str,
    port: u16,
    use_config: bool,
    proxy_cmd: Option<&str>,
) -> Result<SocketStream> {
    let mut effective_host = host.to_string();
    let mut effective_port = port;
    let mut proxy = proxy_cmd.map(str::to_owned);

    if use_config {
        let config = UserSshConfig::load();
        if proxy.is_none() {
            proxy = config.lookup(host).proxy_command;
        }
        let (mapped_host, mapped_port) = config.resolve_target(host, port);
        effective_host = mapped_host;
        effective_port = mapped_port;
    }

    if let Some(proxy) = proxy.filter(|p| !p.eq_ignore_ascii_case("none")) {
        let command_line = substitute_proxy_tokens(&proxy, &effective_host, effective_port);
        debug!(
            host = %effective_host,
            port = effective_port,
            command = %command_line,
            "using proxy command instead of direct connection"
        );
        return Ok(SocketStream::Proxy(ProxyStream::spawn(&command_line)?));
    }

    debug!(host = %effective_host, port = effective_port, "opening socket");

    let addrs: Vec<_> = tokio::net::lookup_host((effective_host.as_str(), effective_port))
        .await
        .map_err(|source| Error::Resolution {
            host: host.to_string(),
            port,
            source,
        })?
        .collect();

    let mut last_error: Option<io::Error> = None;
    let mut attempt = 0;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if attempt > 0 {
                    debug!(%addr, attempt, "connect succeeded after earlier failures");
                }
                return Ok(SocketStream::Tcp(stream));
            }
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                attempt += 1;
                last_error = Some(err);
            }
        }
    }

    Err(Error::Resolution {
        host: host.to_string(),
        port,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
    })
}
