//! Per-channel server sessions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, ServerError};

/// Upper bound on bytes delivered to the hooks in one call.
pub const MAX_READ: usize = 16 * 1024;

/// Channel-scoped events routed from the transport to a session.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// Bytes from the peer, in receive order.
    Data(Bytes),
    /// An admitted exec request.
    Exec(String),
    /// The peer half-closed its side.
    Eof,
}

/// Hooks a protocol layer implements on top of a [`ServerSession`].
///
/// The session delivers an opaque byte stream; message framing belongs to
/// the implementation of these hooks.
#[async_trait]
pub trait SessionHooks: Send + 'static {
    /// Called from the reader task for every chunk of received data.
    /// Returning an error tears the session down.
    async fn data_received(&mut self, session: &ServerSession, data: Bytes) -> Result<()>;

    /// Called when the controller admitted an exec request on this channel.
    async fn exec_requested(&mut self, session: &ServerSession, command: String) -> Result<()> {
        debug!(session = %session.id(), command, "exec request ignored by session hooks");
        Ok(())
    }

    /// Called exactly once when the reader task terminates, however it
    /// terminated.
    async fn reader_exited(&mut self, _session: &ServerSession) {}
}

/// One granted channel on an inbound transport, with a dedicated reader
/// task delivering data to pluggable hooks.
pub struct ServerSession {
    id: Uuid,
    channel_id: ChannelId,
    handle: Handle,
    running: AtomicBool,
    inbound: Mutex<UnboundedReceiver<ChannelEvent>>,
    pending: Mutex<BytesMut>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ServerSession {
    pub(crate) fn new(
        channel_id: ChannelId,
        handle: Handle,
        inbound: UnboundedReceiver<ChannelEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel_id,
            handle,
            running: AtomicBool::new(true),
            inbound: Mutex::new(inbound),
            pending: Mutex::new(BytesMut::new()),
            reader: Mutex::new(None),
        })
    }

    /// Session identity, for logs and bookkeeping.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Channel this session wraps.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Whether the session still accepts traffic. Cleared by [`stop`],
    /// [`close`], or reader termination.
    ///
    /// [`stop`]: ServerSession::stop
    /// [`close`]: ServerSession::close
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send bytes to the peer on this channel.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(ServerError::Closed);
        }
        self.handle
            .data(self.channel_id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Send bytes on the stderr stream of this channel.
    pub async fn send_stderr(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(ServerError::Closed);
        }
        self.handle
            .extended_data(self.channel_id, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Report an exit status for an exec-style channel.
    pub async fn send_exit_status(&self, status: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.channel_id, status)
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Half-close our side of the channel.
    pub async fn send_eof(&self) -> Result<()> {
        self.handle
            .eof(self.channel_id)
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Receive up to `max` bytes, or `None` once the peer has closed.
    ///
    /// Only meaningful for sessions without a reader task; once
    /// [`start_reader`] has been called the reader consumes the inbound
    /// queue.
    ///
    /// [`start_reader`]: ServerSession::start_reader
    pub async fn recv(&self, max: usize) -> Option<Bytes> {
        loop {
            {
                let mut pending = self.pending.lock().await;
                if !pending.is_empty() {
                    let take = pending.len().min(max.max(1));
                    return Some(pending.copy_to_bytes(take));
                }
            }
            if !self.is_running() {
                return None;
            }
            let event = self.inbound.lock().await.recv().await;
            match event {
                Some(ChannelEvent::Data(data)) => {
                    self.pending.lock().await.extend_from_slice(&data);
                }
                Some(ChannelEvent::Exec(command)) => {
                    debug!(session = %self.id, command, "exec event discarded in pull mode");
                }
                Some(ChannelEvent::Eof) | None => return None,
            }
        }
    }

    /// Signal the reader task to stop without forcing the channel closed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the session and close the channel. A reader blocked on the
    /// inbound queue is unblocked by the resulting close event.
    pub async fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(session = %self.id, "closing session");
        }
        let _ = self.handle.close(self.channel_id).await;
    }

    /// Spawn the reader task delivering inbound data to `hooks`.
    ///
    /// `exited` receives this session's channel id exactly once when the
    /// reader terminates, so the owner can deregister it.
    pub async fn start_reader(
        self: &Arc<Self>,
        mut hooks: Box<dyn SessionHooks>,
        exited: UnboundedSender<ChannelId>,
    ) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            debug!(session = %session.id, "reader task started");
            loop {
                if !session.is_running() {
                    break;
                }
                let event = session.inbound.lock().await.recv().await;
                let result = match event {
                    Some(ChannelEvent::Data(data)) => {
                        let mut data = data;
                        let mut delivery = Ok(());
                        // Chunk oversized deliveries to the read bound.
                        while !data.is_empty() && delivery.is_ok() {
                            let take = data.len().min(MAX_READ);
                            delivery = hooks
                                .data_received(&session, data.split_to(take))
                                .await;
                        }
                        delivery
                    }
                    Some(ChannelEvent::Exec(command)) => {
                        hooks.exec_requested(&session, command).await
                    }
                    Some(ChannelEvent::Eof) | None => {
                        debug!(session = %session.id, "peer closed, exiting reader task");
                        break;
                    }
                };
                if let Err(err) = result {
                    if session.is_running() {
                        error!(session = %session.id, error = %err, "session hooks failed, closing session");
                        session.close().await;
                    } else {
                        debug!(session = %session.id, error = %err, "session hooks failed during shutdown");
                    }
                    break;
                }
            }
            session.running.store(false, Ordering::SeqCst);
            hooks.reader_exited(&session).await;
            let _ = exited.send(session.channel_id);
            debug!(session = %session.id, "reader task exited");
        });
        *self.reader.lock().await = Some(task);
    }

    /// Await the reader task, if one was started.
    pub async fn join_reader(&self) {
        let task = self.reader.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
