//! Client connection and session abstractions

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::{debug, warn};

use crate::cache::HandleCache;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::transport::TransportHandle;

/// Largest read handed back in one call, matching the transport's own
/// buffering granularity.
pub const MAX_SSH_BUF: usize = 16 * 1024;

/// One channel over a cached transport handle.
///
/// The connection owns exactly one channel. Closing it (explicitly or by
/// drop) closes the channel first, then returns the handle to the cache it
/// was issued from.
pub struct Connection {
    host: String,
    port: u16,
    username: String,
    cache: Arc<dyn HandleCache>,
    handle: Option<Arc<TransportHandle>>,
    channel: Option<Channel<Msg>>,
    stdout: BytesMut,
    stderr: BytesMut,
    exit_status: Option<u32>,
    eof: bool,
}

impl Connection {
    /// Obtain a handle from `cache` and open one session channel on it.
    ///
    /// When `username` is `None` the local username is used.
    pub async fn open(
        host: &str,
        port: u16,
        username: Option<&str>,
        credentials: &Credentials,
        cache: Arc<dyn HandleCache>,
        proxy_cmd: Option<&str>,
    ) -> Result<Self> {
        let username = username
            .map(str::to_owned)
            .unwrap_or_else(whoami::username);
        let handle = cache
            .get(host, port, &username, credentials, proxy_cmd)
            .await?;

        debug!(host, port, handle = %handle.id(), "opening channel");
        let channel = match handle.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(release_err) = cache.release(&handle).await {
                    warn!(error = %release_err, "release after failed channel open");
                }
                return Err(err);
            }
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            cache,
            handle: Some(handle),
            channel: Some(channel),
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            exit_status: None,
            eof: false,
        })
    }

    /// Target host this connection was opened against.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Username the transport authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether both the channel and its transport are still live.
    pub async fn is_active(&self) -> bool {
        match (&self.channel, &self.handle) {
            (Some(_), Some(handle)) => handle.is_active().await,
            _ => false,
        }
    }

    /// Exit status reported by the remote side, once seen.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    fn channel(&self) -> Result<&Channel<Msg>> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Channel("connection is closed".to_string()))
    }

    /// Send bytes on the channel, returning the number written. The
    /// transport accepts the whole buffer, so this always writes all of
    /// `data`.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.channel()?.data(data).await?;
        Ok(data.len())
    }

    /// Send the whole buffer.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.channel()?.data(data).await?;
        Ok(())
    }

    /// Execute a command on the channel (exec request). Fails when the
    /// peer refuses the request.
    pub async fn exec(&mut self, command: &str) -> Result<()> {
        self.channel()?.exec(true, command).await?;
        self.await_request_reply("exec").await
    }

    /// Request the named subsystem on the channel. Fails when the peer
    /// refuses the request.
    pub async fn invoke_subsystem(&mut self, name: &str) -> Result<()> {
        self.channel()?.request_subsystem(true, name).await?;
        self.await_request_reply("subsystem").await
    }

    /// Wait for the success/failure reply to a channel request, buffering
    /// any data that arrives ahead of it.
    async fn await_request_reply(&mut self, request: &str) -> Result<()> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::Channel("connection is closed".to_string()))?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(Error::Channel(format!("{request} request refused by peer")))
                }
                Some(ChannelMsg::Data { data }) => self.stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        self.stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit_status = Some(exit_status)
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.eof = true;
                    return Err(Error::Channel(format!(
                        "channel closed before {request} reply"
                    )));
                }
                Some(_) => {}
            }
        }
    }

    /// Request a PTY on the channel before starting a command or shell.
    pub async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.channel()?
            .request_pty(false, term, cols, rows, 0, 0, &[])
            .await?;
        Ok(())
    }

    /// Receive up to `max` bytes from the channel's primary stream.
    ///
    /// Returns `Ok(None)` once the peer has closed its side: end-of-stream
    /// is explicit, never an empty buffer.
    pub async fn recv(&mut self, max: usize) -> Result<Option<Bytes>> {
        loop {
            if !self.stdout.is_empty() {
                let take = self.stdout.len().min(max.max(1));
                return Ok(Some(self.stdout.copy_to_bytes(take)));
            }
            if self.eof {
                return Ok(None);
            }
            self.pump().await?;
        }
    }

    /// Receive up to `max` bytes from the stderr stream of an exec-style
    /// channel. `Ok(None)` once the peer has closed.
    pub async fn recv_stderr(&mut self, max: usize) -> Result<Option<Bytes>> {
        loop {
            if !self.stderr.is_empty() {
                let take = self.stderr.len().min(max.max(1));
                return Ok(Some(self.stderr.copy_to_bytes(take)));
            }
            if self.eof {
                return Ok(None);
            }
            self.pump().await?;
        }
    }

    /// Whether buffered primary-stream data is available without waiting.
    pub fn recv_ready(&self) -> bool {
        !self.stdout.is_empty()
    }

    /// Whether buffered stderr data is available without waiting.
    pub fn recv_stderr_ready(&self) -> bool {
        !self.stderr.is_empty()
    }

    /// Pull one message from the channel into the receive buffers.
    async fn pump(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::Channel("connection is closed".to_string()))?;
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => self.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    self.stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!(exit_status, "remote reported exit status");
                self.exit_status = Some(exit_status);
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => self.eof = true,
            None => self.eof = true,
            Some(_) => {}
        }
        Ok(())
    }

    /// Drain the channel until the peer has fully closed it, buffering any
    /// remaining output and capturing the exit status.
    pub async fn wait_close(&mut self) -> Result<()> {
        while !self.eof {
            self.pump().await?;
        }
        // The exit status may trail the EOF marker.
        if let Some(channel) = self.channel.as_mut() {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => self.stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext } => {
                        if ext == 1 {
                            self.stderr.extend_from_slice(&data);
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        self.exit_status = Some(exit_status)
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Take everything buffered on the primary stream.
    pub fn take_stdout(&mut self) -> Bytes {
        self.stdout.split().freeze()
    }

    /// Take everything buffered on the stderr stream.
    pub fn take_stderr(&mut self) -> Bytes {
        self.stderr.split().freeze()
    }

    /// Close the channel, then release the handle back to the cache.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            debug!(host = %self.host, port = self.port, "closing channel");
            if let Err(err) = channel.close().await {
                debug!(error = %err, "channel close");
            }
        }
        if let Some(handle) = self.handle.take() {
            self.cache.release(&handle).await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best-effort release when the caller did not close explicitly.
        if let Some(handle) = self.handle.take() {
            let cache = Arc::clone(&self.cache);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = cache.release(&handle).await {
                        warn!(error = %err, "release on drop failed");
                    }
                });
            }
        }
    }
}

/// A session running a named subsystem (e.g. `sftp`, `netconf`).
pub struct SubsystemSession {
    inner: Connection,
}

impl SubsystemSession {
    /// Open a connection and request `subsystem` on its channel.
    pub async fn open(
        host: &str,
        port: u16,
        subsystem: &str,
        username: Option<&str>,
        credentials: &Credentials,
        cache: Arc<dyn HandleCache>,
        proxy_cmd: Option<&str>,
    ) -> Result<Self> {
        let mut inner =
            Connection::open(host, port, username, credentials, cache, proxy_cmd).await?;
        if let Err(err) = inner.invoke_subsystem(subsystem).await {
            let _ = inner.close().await;
            return Err(err);
        }
        Ok(Self { inner })
    }
}

impl Deref for SubsystemSession {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.inner
    }
}

impl DerefMut for SubsystemSession {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.inner
    }
}

/// A session executing one command, like a remote pipe.
///
/// Give command sessions a cache instance of their own, separate from the
/// one generic sessions share, so exec-channel state never bleeds across
/// unrelated callers.
pub struct CommandSession {
    inner: Connection,
}

impl CommandSession {
    /// Open a connection and execute `command` on its channel.
    pub async fn open(
        host: &str,
        port: u16,
        command: &str,
        username: Option<&str>,
        credentials: &Credentials,
        cache: Arc<dyn HandleCache>,
        proxy_cmd: Option<&str>,
    ) -> Result<Self> {
        let mut inner =
            Connection::open(host, port, username, credentials, cache, proxy_cmd).await?;
        if let Err(err) = inner.exec(command).await {
            let _ = inner.close().await;
            return Err(err);
        }
        Ok(Self { inner })
    }
}

impl Deref for CommandSession {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.inner
    }
}

impl DerefMut for CommandSession {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.inner
    }
}
