//! End-to-end tests driving the hawser client against the in-repo server
//! over loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use hawser::{
    CommandSession, Connection, ConnectionCache, Credentials, DirectCache, HandleCache,
    RemoteCommand, SubsystemSession,
};
use hawser_server::{
    ServerListener, ServerSession, SessionFactory, SessionHooks, UserPassController,
};

const USER: &str = "admin";
const PASS: &str = "swordfish";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Echoes received data back, emulates a tiny command executor for exec
/// requests, and counts reader exits.
struct EchoHooks {
    exits: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionHooks for EchoHooks {
    async fn data_received(
        &mut self,
        session: &ServerSession,
        data: Bytes,
    ) -> hawser_server::Result<()> {
        session.send(&data).await
    }

    async fn exec_requested(
        &mut self,
        session: &ServerSession,
        command: String,
    ) -> hawser_server::Result<()> {
        if let Some(message) = command.strip_prefix("fail ") {
            session.send_stderr(message.as_bytes()).await?;
            session.send_exit_status(2).await?;
        } else {
            session.send(format!("ran:{command}\n").as_bytes()).await?;
            session.send_exit_status(0).await?;
        }
        session.send_eof().await?;
        session.close().await;
        Ok(())
    }

    async fn reader_exited(&mut self, _session: &ServerSession) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo_factory(exits: Arc<AtomicUsize>) -> SessionFactory {
    Arc::new(move || -> Box<dyn SessionHooks> {
        Box::new(EchoHooks {
            exits: Arc::clone(&exits),
        })
    })
}

async fn start_server(
    controller: UserPassController,
    exits: Arc<AtomicUsize>,
) -> Arc<ServerListener> {
    init_tracing();
    ServerListener::bind(0, None, Arc::new(controller), echo_factory(exits))
        .await
        .expect("listener binds on an ephemeral port")
}

fn credentials() -> Credentials {
    Credentials::password(PASS)
}

/// Poll until the listener tracks `expected` live connections.
async fn wait_for_connections(listener: &ServerListener, expected: usize) -> bool {
    for _ in 0..250 {
        if listener.connection_count().await == expected {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_listener_assigns_port_and_close_unblocks_join() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    assert_ne!(listener.port(), 0);

    // A live, authenticated handler must not wedge shutdown.
    let cache = DirectCache::new();
    let handle = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    assert!(wait_for_connections(&listener, 1).await);

    listener.close();
    tokio::time::timeout(Duration::from_secs(5), listener.join())
        .await
        .expect("join returns promptly after close");
    assert_eq!(listener.connection_count().await, 0);

    cache.release(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_authentication_never_enters_live_set() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;

    let cache = DirectCache::new();
    let err = cache
        .get(
            "127.0.0.1",
            listener.port(),
            USER,
            &Credentials::password("wrong"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, hawser::Error::Authentication { .. }));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.connection_count().await, 0);

    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_pooling_cache_reuses_identical_handle() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache = ConnectionCache::with_limits("reuse", Duration::from_secs(2), 8);

    let first = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    let first_id = first.id();
    cache.release(&first).await?;

    // Claimed again before the idle delay elapses: the identical handle
    // comes back and its pending timer is cancelled.
    let second = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    assert_eq!(second.id(), first_id);
    let stats = cache.stats().await;
    assert_eq!(stats.handles, 1);
    assert_eq!(stats.channels_in_use, 1);
    assert_eq!(stats.pending_timers, 0);

    cache.release(&second).await?;
    cache.flush().await;
    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_channel_cap_forces_second_handle() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache = ConnectionCache::with_limits("capped", Duration::from_secs(2), 2);

    let first = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    let second = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    let third = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;

    assert_eq!(first.id(), second.id());
    assert_ne!(third.id(), first.id());
    let stats = cache.stats().await;
    assert_eq!(stats.handles, 2);
    assert_eq!(stats.channels_in_use, 3);

    for handle in [&first, &second, &third] {
        cache.release(handle).await?;
    }
    cache.flush().await;
    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_idle_timer_evicts_and_fresh_get_reconnects() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache = ConnectionCache::with_limits("idle", Duration::from_millis(100), 8);

    let handle = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    let original_id = handle.id();
    cache.release(&handle).await?;
    assert_eq!(cache.stats().await.pending_timers, 1);

    sleep(Duration::from_millis(400)).await;
    let stats = cache.stats().await;
    assert_eq!(stats.handles, 0);
    assert_eq!(stats.pending_timers, 0);

    let fresh = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    assert_ne!(fresh.id(), original_id);

    cache.release(&fresh).await?;
    cache.flush().await;
    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_flush_leaves_no_timers_and_no_handles() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache = ConnectionCache::with_limits("flush", Duration::from_secs(30), 8);

    let handle = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    cache.release(&handle).await?;
    assert_eq!(cache.stats().await.pending_timers, 1);

    cache.flush().await;
    let stats = cache.stats().await;
    assert_eq!(stats.handles, 0);
    assert_eq!(stats.pending_timers, 0);
    assert!(wait_for_connections(&listener, 0).await);

    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_release_of_unknown_handle_is_a_consistency_error() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;

    let direct = DirectCache::new();
    let foreign = direct
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;

    let pooled = ConnectionCache::new("strict");
    let err = pooled.release(&foreign).await.unwrap_err();
    assert!(matches!(err, hawser::Error::CacheConsistency(id) if id == foreign.id()));

    direct.release(&foreign).await?;
    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_session_echo_and_reader_exits_exactly_once() -> Result<()> {
    let exits = Arc::new(AtomicUsize::new(0));
    let listener = start_server(UserPassController::new(USER, PASS), Arc::clone(&exits)).await;

    let cache: Arc<dyn HandleCache> = Arc::new(DirectCache::new());
    let mut conn = Connection::open(
        "127.0.0.1",
        listener.port(),
        Some(USER),
        &credentials(),
        Arc::clone(&cache),
        None,
    )
    .await?;

    conn.send_all(b"over the side").await?;
    let mut echoed = Vec::new();
    while echoed.len() < b"over the side".len() {
        match conn.recv(hawser::MAX_SSH_BUF).await? {
            Some(chunk) => echoed.extend_from_slice(&chunk),
            None => break,
        }
    }
    assert_eq!(echoed, b"over the side");

    conn.close().await?;
    for _ in 0..250 {
        if exits.load(Ordering::SeqCst) == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(exits.load(Ordering::SeqCst), 1);

    listener.close();
    listener.join().await;
    // The exit hook must not fire a second time during listener teardown.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_command_runner_reuses_pooled_handle_until_idle_expiry() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS).allow_exec(),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache = Arc::new(ConnectionCache::with_limits(
        "commands",
        Duration::from_millis(150),
        8,
    ));
    let pooled = || {
        RemoteCommand::new(
            "status check",
            "127.0.0.1",
            Arc::clone(&cache) as Arc<dyn HandleCache>,
        )
            .port(listener.port())
            .username(USER)
            .credentials(credentials())
    };

    let output = pooled().run().await?;
    assert_eq!(output, "ran:status check\n");
    let output = pooled().run().await?;
    assert_eq!(output, "ran:status check\n");

    // Two sequential runs shared one transport: use count back to zero,
    // handle still pooled, one server-side connection.
    let stats = cache.stats().await;
    assert_eq!(stats.handles, 1);
    assert_eq!(stats.channels_in_use, 0);
    assert!(wait_for_connections(&listener, 1).await);

    // After the idle delay the handle is gone; a third run opens a new one.
    sleep(Duration::from_millis(500)).await;
    assert!(wait_for_connections(&listener, 0).await);
    let output = pooled().run().await?;
    assert_eq!(output, "ran:status check\n");
    assert!(wait_for_connections(&listener, 1).await);

    cache.flush().await;
    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_command_carries_status_and_stderr() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS).allow_exec(),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache: Arc<dyn HandleCache> = Arc::new(DirectCache::new());

    let err = RemoteCommand::new("fail broken winch", "127.0.0.1", Arc::clone(&cache))
        .port(listener.port())
        .username(USER)
        .credentials(credentials())
        .run()
        .await
        .unwrap_err();
    match err {
        hawser::Error::CommandFailed {
            status,
            command,
            output,
        } => {
            assert_eq!(status, 2);
            assert_eq!(command, "fail broken winch");
            assert_eq!(output, "broken winch");
        }
        other => panic!("expected command failure, got {other}"),
    }

    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_command_session_status_stderr_surface() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS).allow_exec(),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache: Arc<dyn HandleCache> = Arc::new(DirectCache::new());

    let mut session = CommandSession::open(
        "127.0.0.1",
        listener.port(),
        "fail rope snapped",
        Some(USER),
        &credentials(),
        Arc::clone(&cache),
        None,
    )
    .await?;
    session.wait_close().await?;
    assert_eq!(session.exit_status(), Some(2));
    assert_eq!(&session.take_stderr()[..], b"rope snapped");
    session.close().await?;

    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_subsystem_admission_and_refusal() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS).with_subsystem("echo"),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let cache: Arc<dyn HandleCache> = Arc::new(DirectCache::new());

    let mut session = SubsystemSession::open(
        "127.0.0.1",
        listener.port(),
        "echo",
        Some(USER),
        &credentials(),
        Arc::clone(&cache),
        None,
    )
    .await?;
    session.send_all(b"ahoy").await?;
    let reply = session.recv(hawser::MAX_SSH_BUF).await?;
    assert_eq!(reply.as_deref(), Some(&b"ahoy"[..]));
    session.close().await?;

    let refused = SubsystemSession::open(
        "127.0.0.1",
        listener.port(),
        "sftp",
        Some(USER),
        &credentials(),
        Arc::clone(&cache),
        None,
    )
    .await;
    assert!(refused.is_err());

    listener.close();
    listener.join().await;
    Ok(())
}

#[tokio::test]
async fn test_direct_cache_release_disconnects() -> Result<()> {
    let listener = start_server(
        UserPassController::new(USER, PASS),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;

    let cache = DirectCache::new();
    let handle = cache
        .get("127.0.0.1", listener.port(), USER, &credentials(), None)
        .await?;
    assert!(wait_for_connections(&listener, 1).await);

    cache.release(&handle).await?;
    assert!(wait_for_connections(&listener, 0).await);

    listener.close();
    listener.join().await;
    Ok(())
}
