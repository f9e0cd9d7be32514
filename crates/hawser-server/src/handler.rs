//! Per-client connection handling

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthController, AuthMethod};
use crate::error::{Result, ServerError};
use crate::session::{ChannelEvent, ServerSession, SessionHooks};

/// Builds the session hooks for each granted channel.
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn SessionHooks> + Send + Sync>;

/// Bound on one wait for a granted channel, so a shutdown request can
/// interrupt what would otherwise block indefinitely.
const CHANNEL_POLL: Duration = Duration::from_secs(1);

/// Bound on the time a client may take to authenticate after the TCP
/// accept.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn method_set(methods: &[AuthMethod]) -> MethodSet {
    let kinds: Vec<MethodKind> = methods
        .iter()
        .map(|method| match method {
            AuthMethod::None => MethodKind::None,
            AuthMethod::Password => MethodKind::Password,
            AuthMethod::PublicKey => MethodKind::PublicKey,
        })
        .collect();
    MethodSet::from(kinds.as_slice())
}

/// A granted channel travelling from the transport glue to the handler's
/// channel-accept loop.
struct GrantedChannel {
    id: ChannelId,
    events: UnboundedReceiver<ChannelEvent>,
    handle: server::Handle,
}

/// Owns one authenticated inbound transport: accepts its channel requests,
/// spawns a [`ServerSession`] per granted channel, and tears everything
/// down on close.
pub struct ConnectionHandler {
    id: Uuid,
    peer_addr: SocketAddr,
    username: String,
    sessions: Mutex<Vec<Arc<ServerSession>>>,
    running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    live_set: Weak<Mutex<Vec<Arc<ConnectionHandler>>>>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("username", &self.username)
            .finish()
    }
}

impl ConnectionHandler {
    /// Run the server-side handshake on an accepted socket and, once the
    /// client has authenticated, start the channel-accept loop.
    ///
    /// Fails without side effects when the client never completes
    /// authentication; a failed client therefore never enters the
    /// listener's live set.
    pub(crate) async fn accept(
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: Arc<server::Config>,
        controller: Arc<dyn AuthController>,
        factory: SessionFactory,
        live_set: Weak<Mutex<Vec<Arc<ConnectionHandler>>>>,
    ) -> Result<Arc<Self>> {
        let (granted_tx, granted_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = oneshot::channel();
        let glue = TransportGlue {
            controller,
            peer_addr,
            authenticated: false,
            auth_tx: Some(auth_tx),
            channels: HashMap::new(),
            granted_tx,
        };

        let running_session = server::run_stream(config, socket, glue).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = running_session.await {
                debug!(%peer_addr, error = %err, "transport driver ended with error");
            }
        });

        let username = match tokio::time::timeout(AUTH_TIMEOUT, auth_rx).await {
            Ok(Ok(username)) => username,
            Ok(Err(_)) | Err(_) => {
                debug!(%peer_addr, "client did not authenticate, dropping connection");
                driver.abort();
                return Err(ServerError::AuthenticationIncomplete);
            }
        };

        let handler = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            username,
            sessions: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            driver: Mutex::new(Some(driver)),
            accept_task: Mutex::new(None),
            live_set,
        });
        let task = tokio::spawn(Self::channel_accept_loop(
            Arc::clone(&handler),
            granted_rx,
            factory,
        ));
        *handler.accept_task.lock().await = Some(task);
        Ok(handler)
    }

    /// Handler identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Username the client authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Number of live sessions on this connection.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the handler is still accepting channels.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn channel_accept_loop(
        this: Arc<Self>,
        mut granted_rx: UnboundedReceiver<GrantedChannel>,
        factory: SessionFactory,
    ) {
        let (exited_tx, mut exited_rx) = mpsc::unbounded_channel();
        debug!(handler = %this.id, "accepting channels");
        loop {
            if !this.running.load(Ordering::SeqCst) {
                break;
            }
            while let Ok(channel_id) = exited_rx.try_recv() {
                this.remove_session(channel_id).await;
            }
            match tokio::time::timeout(CHANNEL_POLL, granted_rx.recv()).await {
                Ok(Some(granted)) => {
                    if !this.running.load(Ordering::SeqCst) {
                        debug!(handler = %this.id, "channel granted after shutdown, closing it");
                        let _ = granted.handle.close(granted.id).await;
                        break;
                    }
                    let session = ServerSession::new(granted.id, granted.handle, granted.events);
                    session.start_reader(factory(), exited_tx.clone()).await;
                    debug!(handler = %this.id, session = %session.id(), "session started");
                    this.sessions.lock().await.push(session);
                }
                Ok(None) => {
                    info!(handler = %this.id, "transport no longer active, exiting channel accept loop");
                    break;
                }
                // Poll bound elapsed; loop to observe the shutdown flag.
                Err(_) => continue,
            }
        }

        // Teardown initiated from this side of the loop (peer disconnect or
        // transport failure). close() arbitrates via the running flag.
        if this.running.swap(false, Ordering::SeqCst) {
            let sessions: Vec<_> = this.sessions.lock().await.drain(..).collect();
            for session in &sessions {
                session.close().await;
            }
            for session in &sessions {
                session.join_reader().await;
            }
            this.detach().await;
        }
        debug!(handler = %this.id, "channel accept task exited");
    }

    async fn remove_session(&self, channel_id: ChannelId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(position) = sessions.iter().position(|s| s.channel_id() == channel_id) {
            let session = sessions.remove(position);
            debug!(handler = %self.id, session = %session.id(), "session deregistered");
        }
    }

    async fn detach(&self) {
        if let Some(live) = self.live_set.upgrade() {
            live.lock().await.retain(|handler| handler.id != self.id);
        }
    }

    /// Close every tracked session, stop the transport, drop out of the
    /// owning listener's live set, and wait for the handler's own task.
    pub async fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(handler = %self.id, "closing connection handler");
            let sessions: Vec<_> = self.sessions.lock().await.drain(..).collect();
            for session in &sessions {
                session.close().await;
            }
            // Stopping the driver tears down the transport and its socket,
            // which also unblocks any reader still waiting on the peer.
            if let Some(driver) = self.driver.lock().await.take() {
                driver.abort();
            }
            for session in &sessions {
                session.join_reader().await;
            }
            self.detach().await;
        }
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// russh event glue for one inbound transport. Delegates authentication
/// and admission decisions to the [`AuthController`] and routes channel
/// events to their sessions.
struct TransportGlue {
    controller: Arc<dyn AuthController>,
    peer_addr: SocketAddr,
    authenticated: bool,
    auth_tx: Option<oneshot::Sender<String>>,
    channels: HashMap<ChannelId, UnboundedSender<ChannelEvent>>,
    granted_tx: UnboundedSender<GrantedChannel>,
}

impl TransportGlue {
    fn accept_auth(&mut self, username: &str, method: &str) -> Auth {
        info!(peer = %self.peer_addr, username, method, "authentication succeeded");
        self.authenticated = true;
        if let Some(tx) = self.auth_tx.take() {
            let _ = tx.send(username.to_string());
        }
        Auth::Accept
    }

    fn reject_auth(&self, username: &str, method: &str) -> Auth {
        debug!(peer = %self.peer_addr, username, method, "authentication rejected");
        Auth::Reject {
            proceed_with_methods: Some(method_set(
                &self.controller.allowed_auth_methods(username),
            )),
            partial_success: false,
        }
    }
}

impl server::Handler for TransportGlue {
    type Error = ServerError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        if self.controller.check_auth_none(user).await {
            Ok(self.accept_auth(user, "none"))
        } else {
            Ok(self.reject_auth(user, "none"))
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if self.controller.check_auth_password(user, password).await {
            Ok(self.accept_auth(user, "password"))
        } else {
            Ok(self.reject_auth(user, "password"))
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth> {
        if self.controller.check_auth_publickey(user, public_key).await {
            Ok(self.accept_auth(user, "publickey"))
        } else {
            Ok(self.reject_auth(user, "publickey"))
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool> {
        if !self.authenticated || !self.controller.check_channel_open_request("session") {
            debug!(peer = %self.peer_addr, "session channel refused");
            return Ok(false);
        }
        let channel_id = channel.id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(channel_id, tx);
        let granted = GrantedChannel {
            id: channel_id,
            events: rx,
            handle: session.handle(),
        };
        if self.granted_tx.send(granted).is_err() {
            // Handler already torn down; refuse the channel.
            self.channels.remove(&channel_id);
            return Ok(false);
        }
        debug!(peer = %self.peer_addr, channel = ?channel_id, "session channel granted");
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<()> {
        if let Some(tx) = self.channels.get(&channel) {
            let _ = tx.send(ChannelEvent::Data(Bytes::copy_from_slice(data)));
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let command = String::from_utf8_lossy(data).to_string();
        if self.authenticated && self.controller.check_exec_request(&command) {
            if let Some(tx) = self.channels.get(&channel) {
                let _ = tx.send(ChannelEvent::Exec(command));
                let _ = session.channel_success(channel);
                return Ok(());
            }
        }
        debug!(peer = %self.peer_addr, command, "exec request refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if self.authenticated && self.controller.check_subsystem_request(name) {
            debug!(peer = %self.peer_addr, subsystem = name, "subsystem granted");
            let _ = session.channel_success(channel);
        } else {
            debug!(peer = %self.peer_addr, subsystem = name, "subsystem refused");
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<()> {
        debug!(peer = %self.peer_addr, "shell request refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        debug!(peer = %self.peer_addr, "pty request refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(tx) = self.channels.get(&channel) {
            let _ = tx.send(ChannelEvent::Eof);
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        // Dropping the sender ends the session's inbound queue.
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for TransportGlue {
    fn drop(&mut self) {
        if !self.channels.is_empty() {
            warn!(
                peer = %self.peer_addr,
                channels = self.channels.len(),
                "transport dropped with live channels"
            );
        }
    }
}
