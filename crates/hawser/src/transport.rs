//! Transport establishment: client handshake and the authentication ladder

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{AgentAuthError, Channel, CryptoVec, Disconnect, Signer};
use tokio::sync::Mutex;
use uuid::Uuid;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::socket::{open_socket, SocketStream};

/// Client-side event handler for the transport library.
///
/// Host key verification is the transport capability's concern; every key is
/// accepted here and recorded at debug level.
pub(crate) struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(algorithm = %server_public_key.algorithm(), "accepting server host key");
        Ok(true)
    }
}

/// An authenticated transport to one remote endpoint, capable of
/// multiplexing channels. Cheap to share; channel opening is serialized
/// through an internal mutex.
pub struct TransportHandle {
    id: Uuid,
    remote: String,
    inner: Mutex<Handle<ClientHandler>>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl TransportHandle {
    /// Identity of this handle, stable for its lifetime. The cache keys its
    /// bookkeeping on this.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `user@host:port` the handle was established for.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Whether the transport still considers itself connected. Returns
    /// false once the peer has disconnected or the driver has shut down.
    pub async fn is_active(&self) -> bool {
        !self.inner.lock().await.is_closed()
    }

    /// Open one session channel on this transport.
    pub async fn open_channel(&self) -> Result<Channel<client::Msg>> {
        let mut inner = self.inner.lock().await;
        inner.channel_open_session().await.map_err(Error::from)
    }

    /// Disconnect the transport. Pending channels surface end-of-stream.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(err) = inner
            .disconnect(Disconnect::ByApplication, "closing connection", "en")
            .await
        {
            debug!(handle = %self.id, error = %err, "disconnect while closing transport");
        }
    }
}

/// Open a raw socket to the target and establish an authenticated transport
/// over it.
///
/// Authentication is attempted strictly in order, stopping at the first
/// success: supplied password, supplied private key, then each key available
/// from the local agent. If every form fails the connection is torn down and
/// an authentication error is returned.
pub async fn open_transport(
    host: &str,
    port: u16,
    username: &str,
    credentials: &Credentials,
    proxy_cmd: Option<&str>,
) -> Result<TransportHandle> {
    let stream = open_socket(host, port, true, proxy_cmd).await?;
    let handle = authenticate(stream, username, credentials).await?;
    info!(host, port, username, "transport established");
    Ok(TransportHandle {
        id: Uuid::new_v4(),
        remote: format!("{username}@{host}:{port}"),
        inner: Mutex::new(handle),
    })
}

async fn authenticate(
    stream: SocketStream,
    username: &str,
    credentials: &Credentials,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..client::Config::default()
    });

    let mut handle = client::connect_stream(config, stream, ClientHandler).await?;
    debug!(username, "client handshake completed");

    if let Some(password) = &credentials.password {
        match handle.authenticate_password(username, password).await {
            Ok(result) if result.success() => return Ok(handle),
            Ok(_) => debug!(username, "password authentication rejected, continuing"),
            Err(err) => debug!(username, error = %err, "password authentication failed, continuing"),
        }
    }

    if let Some(key_path) = &credentials.key_path {
        match russh::keys::load_secret_key(key_path, credentials.key_passphrase.as_deref()) {
            Ok(key) => {
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                match handle.authenticate_publickey(username, key).await {
                    Ok(result) if result.success() => return Ok(handle),
                    Ok(_) => debug!(username, "public key rejected, continuing"),
                    Err(err) => debug!(username, error = %err, "public key authentication failed, continuing"),
                }
            }
            Err(err) => debug!(path = %key_path.display(), error = %err, "could not load private key, continuing"),
        }
    }

    match authenticate_with_agent(&mut handle, username).await {
        Ok(true) => return Ok(handle),
        Ok(false) => debug!(username, "no agent key accepted"),
        Err(err) => debug!(username, error = %err, "agent authentication unavailable"),
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "authentication failed", "en")
        .await;
    Err(Error::Authentication {
        username: username.to_string(),
        reason: "all credential forms exhausted".to_string(),
    })
}

/// Send-safe signer delegating signature requests to the local agent.
///
/// The public key is cloned to an owned value before the async block so the
/// returned future does not borrow request-local state across an await.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = std::result::Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Try each key held by the local agent against the server. Returns
/// `Ok(false)` when the agent is reachable but no key was accepted.
#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<ClientHandler>,
    _username: &str,
) -> Result<bool> {
    Err(Error::Agent(
        "key agent access is not supported on this platform".to_string(),
    ))
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<bool> {
    let agent = AgentClient::connect_env()
        .await
        .map_err(|err| Error::Agent(format!("could not reach key agent: {err}")))?;
    let mut agent = agent.dynamic();

    let keys = agent
        .request_identities()
        .await
        .map_err(|err| Error::Agent(format!("could not list agent keys: {err}")))?;
    debug!(username, keys = keys.len(), "trying agent keys");

    for key in &keys {
        let result = handle
            .authenticate_publickey_with(
                username,
                key.clone(),
                None,
                &mut AgentSigner { agent: &mut agent },
            )
            .await;
        match result {
            Ok(result) if result.success() => {
                debug!(username, comment = key.comment(), "agent key accepted");
                return Ok(true);
            }
            Ok(_) => debug!(comment = key.comment(), "agent key rejected"),
            Err(err) => warn!(comment = key.comment(), error = %err, "agent signing failed"),
        }
    }
    Ok(false)
}
