//! Dual-stack listening and shutdown coordination

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use russh::server;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthController;
use crate::error::{Result, ServerError};
use crate::handler::{method_set, ConnectionHandler, SessionFactory};

/// Accepts inbound transport connections and owns the resulting
/// [`ConnectionHandler`]s.
///
/// Binds IPv6 first, then IPv4, so an OS that satisfies both families from
/// one dual-stack bind does exactly that; an `AddrInUse` on the second bind
/// is then expected and tolerated. Requesting port 0 binds an ephemeral
/// port, which is reused for the second family.
pub struct ServerListener {
    port: u16,
    handlers: Arc<Mutex<Vec<Arc<ConnectionHandler>>>>,
    shutdown: watch::Sender<bool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerListener {
    /// Bind listening sockets and start one accept task per bound family.
    ///
    /// With no `host_key_path`, an ephemeral Ed25519 host key is generated.
    pub async fn bind(
        port: u16,
        host_key_path: Option<&Path>,
        controller: Arc<dyn AuthController>,
        factory: SessionFactory,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(Self::transport_config(host_key_path, controller.as_ref())?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers: Arc<Mutex<Vec<Arc<ConnectionHandler>>>> = Arc::new(Mutex::new(Vec::new()));

        let candidates = [
            ("IPv6", IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            ("IPv4", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ];
        let mut bound: Vec<(&'static str, TcpListener)> = Vec::new();
        let mut last_error: Option<(SocketAddr, io::Error)> = None;
        let mut effective_port = port;

        for (family, ip) in candidates {
            let addr = SocketAddr::new(ip, effective_port);
            match TcpListener::bind(addr).await {
                Ok(socket) => {
                    let assigned = socket
                        .local_addr()
                        .map_err(|source| ServerError::Bind {
                            addr: addr.to_string(),
                            source,
                        })?
                        .port();
                    debug!(family, port = assigned, "listening");
                    effective_port = assigned;
                    bound.push((family, socket));
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse && !bound.is_empty() => {
                    debug!(family, "address in use, already covered by dual-stack bind");
                }
                Err(err) => {
                    debug!(family, %addr, error = %err, "bind failed");
                    last_error = Some((addr, err));
                }
            }
        }

        if bound.is_empty() {
            let (addr, source) = last_error.unwrap_or_else(|| {
                (
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address family bound"),
                )
            });
            return Err(ServerError::Bind {
                addr: addr.to_string(),
                source,
            });
        }

        let listener = Arc::new(Self {
            port: effective_port,
            handlers: Arc::clone(&handlers),
            shutdown: shutdown_tx,
            accept_tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = listener.accept_tasks.lock().await;
        for (family, socket) in bound {
            tasks.push(tokio::spawn(accept_loop(
                socket,
                family,
                shutdown_rx.clone(),
                Arc::clone(&handlers),
                Arc::clone(&config),
                Arc::clone(&controller),
                Arc::clone(&factory),
            )));
        }
        drop(tasks);

        info!(port = effective_port, "server listening");
        Ok(listener)
    }

    fn transport_config(
        host_key_path: Option<&Path>,
        controller: &dyn AuthController,
    ) -> Result<server::Config> {
        let key = match host_key_path {
            Some(path) => russh::keys::load_secret_key(path, None)
                .map_err(|err| ServerError::HostKey(err.to_string()))?,
            None => {
                debug!("no host key supplied, generating an ephemeral ed25519 key");
                russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
                    .map_err(|err| ServerError::HostKey(err.to_string()))?
            }
        };

        let mut config = server::Config::default();
        config.methods = method_set(&controller.allowed_auth_methods(""));
        config.keys.push(key);
        config.auth_rejection_time = Duration::from_millis(100);
        config.auth_rejection_time_initial = Some(Duration::ZERO);
        Ok(config)
    }

    /// Port the listener is bound to. Nonzero once `bind` has returned,
    /// also when port 0 was requested.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of live, authenticated client connections.
    pub async fn connection_count(&self) -> usize {
        self.handlers.lock().await.len()
    }

    /// Snapshot of the live handlers.
    pub async fn handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.handlers.lock().await.clone()
    }

    /// Signal shutdown. The accept tasks close every live handler and then
    /// exit; use [`join`] to wait for that to finish. Safe to call more
    /// than once.
    ///
    /// [`join`]: ServerListener::join
    pub fn close(&self) {
        info!(port = self.port, "shutdown signalled");
        let _ = self.shutdown.send(true);
    }

    /// Wait until every accept task has exited.
    pub async fn join(&self) {
        let tasks: Vec<_> = self.accept_tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    socket: TcpListener,
    family: &'static str,
    mut shutdown: watch::Receiver<bool>,
    handlers: Arc<Mutex<Vec<Arc<ConnectionHandler>>>>,
    config: Arc<server::Config>,
    controller: Arc<dyn AuthController>,
    factory: SessionFactory,
) {
    debug!(family, "accept task started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                let _ = changed;
                let live: Vec<_> = handlers.lock().await.drain(..).collect();
                info!(family, handlers = live.len(), "closing live handlers");
                for handler in live {
                    handler.close().await;
                }
                debug!(family, "closing listening socket, exiting accept task");
                return;
            }
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        info!(family, %peer_addr, "client accepted");
                        spawn_setup(
                            stream,
                            peer_addr,
                            shutdown.clone(),
                            Arc::clone(&handlers),
                            Arc::clone(&config),
                            Arc::clone(&controller),
                            Arc::clone(&factory),
                        );
                    }
                    Err(err) => warn!(family, error = %err, "accept failed"),
                }
            }
        }
    }
}

// Handshake and authentication run off the accept loop so one slow client
// cannot stall other accepts. Only authenticated handlers enter the live
// set.
fn spawn_setup(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    handlers: Arc<Mutex<Vec<Arc<ConnectionHandler>>>>,
    config: Arc<server::Config>,
    controller: Arc<dyn AuthController>,
    factory: SessionFactory,
) {
    tokio::spawn(async move {
        let live_set = Arc::downgrade(&handlers);
        match ConnectionHandler::accept(stream, peer_addr, config, controller, factory, live_set)
            .await
        {
            Ok(handler) => {
                if *shutdown.borrow() {
                    debug!(%peer_addr, "client authenticated during shutdown, closing");
                    handler.close().await;
                    return;
                }
                handlers.lock().await.push(handler);
            }
            Err(err) => {
                debug!(%peer_addr, error = %err, "client setup failed");
            }
        }
    });
}
