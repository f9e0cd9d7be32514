//! Connection caching: pooled and direct variants

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::transport::{open_transport, TransportHandle};

/// Default cap on concurrent channels multiplexed over one handle.
pub const DEFAULT_MAX_CHANNELS: u32 = 8;

/// Default delay between a handle's last release and its closure.
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(1);

/// Issues transport handles and takes them back.
///
/// Implementations must never return a handle whose transport reports
/// itself closed. Releasing a handle the cache does not track is a caller
/// bug and surfaces as [`Error::CacheConsistency`].
#[async_trait]
pub trait HandleCache: Send + Sync {
    /// Obtain an authenticated handle for the target, reusing one when the
    /// implementation pools.
    async fn get(
        &self,
        host: &str,
        port: u16,
        username: &str,
        credentials: &Credentials,
        proxy_cmd: Option<&str>,
    ) -> Result<Arc<TransportHandle>>;

    /// Return a handle obtained from [`HandleCache::get`].
    async fn release(&self, handle: &Arc<TransportHandle>) -> Result<()>;

    /// Cancel all pending idle timers and force-close every handle.
    async fn flush(&self);
}

/// Identifies one poolable group of handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    host: String,
    port: u16,
    username: String,
    proxy_command: Option<String>,
}

impl CacheKey {
    fn new(host: &str, port: u16, username: &str, proxy_cmd: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            proxy_command: proxy_cmd.map(str::to_owned),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}:{}",
            self.username,
            self.host,
            self.port,
            self.proxy_command.as_deref().unwrap_or("-")
        )
    }
}

struct PooledEntry {
    handle: Arc<TransportHandle>,
    channels: u32,
    // Bumped on every claim and re-arm so a stale idle timer that lost the
    // abort race cannot close a reclaimed handle.
    timer_epoch: u64,
    idle_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Vec<PooledEntry>>,
    index: HashMap<Uuid, CacheKey>,
}

/// Point-in-time counters for a pooling cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Open handles currently tracked.
    pub handles: usize,
    /// Channels handed out and not yet released.
    pub channels_in_use: u32,
    /// Idle timers armed and not yet fired or cancelled.
    pub pending_timers: usize,
}

/// Pooling cache: reuses authenticated handles keyed by
/// (host, port, username, proxy command), bounded by a per-handle channel
/// cap, with delayed idle release.
pub struct ConnectionCache {
    desc: String,
    idle_delay: Duration,
    max_channels: u32,
    inner: Arc<Mutex<CacheInner>>,
}

impl ConnectionCache {
    /// Create a cache with the default channel cap and idle delay.
    pub fn new(desc: impl Into<String>) -> Self {
        Self::with_limits(desc, DEFAULT_IDLE_DELAY, DEFAULT_MAX_CHANNELS)
    }

    /// Create a cache with an explicit idle delay and channel cap.
    pub fn with_limits(desc: impl Into<String>, idle_delay: Duration, max_channels: u32) -> Self {
        Self {
            desc: desc.into(),
            idle_delay,
            max_channels: max_channels.max(1),
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    /// Current counters, for monitoring and tests.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let mut stats = CacheStats {
            handles: 0,
            channels_in_use: 0,
            pending_timers: 0,
        };
        for entries in inner.entries.values() {
            for entry in entries {
                stats.handles += 1;
                stats.channels_in_use += entry.channels;
                if entry.idle_timer.is_some() {
                    stats.pending_timers += 1;
                }
            }
        }
        stats
    }

    fn arm_idle_timer(&self, key: &CacheKey, entry: &mut PooledEntry) {
        entry.timer_epoch += 1;
        let epoch = entry.timer_epoch;
        let handle_id = entry.handle.id();
        let key = key.clone();
        let inner = Arc::clone(&self.inner);
        let delay = self.idle_delay;
        debug!(handle = %handle_id, %key, "arming idle release timer");
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::expire_entry(inner, key, handle_id, epoch).await;
        }));
    }

    async fn expire_entry(
        inner: Arc<Mutex<CacheInner>>,
        key: CacheKey,
        handle_id: Uuid,
        epoch: u64,
    ) {
        let handle = {
            let mut inner = inner.lock().await;
            let Some(entries) = inner.entries.get_mut(&key) else {
                return;
            };
            let Some(position) = entries.iter().position(|e| e.handle.id() == handle_id) else {
                return;
            };
            // A claim after this timer was armed supersedes it.
            if entries[position].timer_epoch != epoch || entries[position].channels != 0 {
                debug!(handle = %handle_id, "idle timer superseded, keeping handle");
                return;
            }
            let entry = entries.remove(position);
            if entries.is_empty() {
                inner.entries.remove(&key);
            }
            inner.index.remove(&handle_id);
            entry.handle
        };
        debug!(handle = %handle_id, %key, "idle timer expired, closing handle");
        handle.close().await;
    }
}

impl fmt::Display for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionCache(\"{}\", idle_delay={:?}, max_channels={})",
            self.desc, self.idle_delay, self.max_channels
        )
    }
}

#[async_trait]
impl HandleCache for ConnectionCache {
    async fn get(
        &self,
        host: &str,
        port: u16,
        username: &str,
        credentials: &Credentials,
        proxy_cmd: Option<&str>,
    ) -> Result<Arc<TransportHandle>> {
        let key = CacheKey::new(host, port, username, proxy_cmd);

        {
            let mut inner = self.inner.lock().await;
            let mut stale: Vec<Uuid> = Vec::new();
            let mut chosen: Option<Arc<TransportHandle>> = None;

            if let Some(entries) = inner.entries.get_mut(&key) {
                for entry in entries.iter_mut() {
                    if entry.channels >= self.max_channels {
                        continue;
                    }
                    if !entry.handle.is_active().await {
                        debug!(handle = %entry.handle.id(), %key, "entry no longer active, evicting");
                        stale.push(entry.handle.id());
                        continue;
                    }
                    entry.channels += 1;
                    entry.timer_epoch += 1;
                    if let Some(timer) = entry.idle_timer.take() {
                        timer.abort();
                    }
                    debug!(
                        handle = %entry.handle.id(),
                        %key,
                        channels = entry.channels,
                        "reusing pooled handle"
                    );
                    chosen = Some(Arc::clone(&entry.handle));
                    break;
                }
            }

            for id in stale {
                if let Some(entries) = inner.entries.get_mut(&key) {
                    if let Some(position) = entries.iter().position(|e| e.handle.id() == id) {
                        let entry = entries.remove(position);
                        if let Some(timer) = entry.idle_timer {
                            timer.abort();
                        }
                        let handle = entry.handle;
                        tokio::spawn(async move { handle.close().await });
                    }
                    if entries.is_empty() {
                        inner.entries.remove(&key);
                    }
                }
                inner.index.remove(&id);
            }

            if let Some(handle) = chosen {
                return Ok(handle);
            }
        }

        // Cache miss. The lock is not held across establishment.
        let handle = Arc::new(open_transport(host, port, username, credentials, proxy_cmd).await?);
        debug!(handle = %handle.id(), %key, "established new pooled handle");

        let mut inner = self.inner.lock().await;
        inner.index.insert(handle.id(), key.clone());
        inner.entries.entry(key).or_default().push(PooledEntry {
            handle: Arc::clone(&handle),
            channels: 1,
            timer_epoch: 0,
            idle_timer: None,
        });
        Ok(handle)
    }

    async fn release(&self, handle: &Arc<TransportHandle>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .index
            .get(&handle.id())
            .cloned()
            .ok_or(Error::CacheConsistency(handle.id()))?;
        let entries = inner
            .entries
            .get_mut(&key)
            .ok_or(Error::CacheConsistency(handle.id()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.handle.id() == handle.id())
            .ok_or(Error::CacheConsistency(handle.id()))?;

        if entry.channels == 0 {
            warn!(handle = %handle.id(), "release with use count already zero");
        } else {
            entry.channels -= 1;
        }
        debug!(handle = %handle.id(), channels = entry.channels, "released handle");

        if entry.channels == 0 {
            self.arm_idle_timer(&key, entry);
        }
        Ok(())
    }

    async fn flush(&self) {
        let handles: Vec<Arc<TransportHandle>> = {
            let mut inner = self.inner.lock().await;
            inner.index.clear();
            inner
                .entries
                .drain()
                .flat_map(|(_, entries)| entries)
                .map(|entry| {
                    if let Some(timer) = entry.idle_timer {
                        timer.abort();
                    }
                    entry.handle
                })
                .collect()
        };
        debug!(cache = %self, handles = handles.len(), "flushing cache");
        for handle in handles {
            handle.close().await;
        }
    }
}

/// Non-pooling cache: `get` always establishes a fresh handle and `release`
/// closes it immediately. The safer default, and mandatory for callers that
/// must not share authentication state across operations.
#[derive(Debug, Default)]
pub struct DirectCache;

impl DirectCache {
    /// Create a direct (non-pooling) cache.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HandleCache for DirectCache {
    async fn get(
        &self,
        host: &str,
        port: u16,
        username: &str,
        credentials: &Credentials,
        proxy_cmd: Option<&str>,
    ) -> Result<Arc<TransportHandle>> {
        let handle = open_transport(host, port, username, credentials, proxy_cmd).await?;
        Ok(Arc::new(handle))
    }

    async fn release(&self, handle: &Arc<TransportHandle>) -> Result<()> {
        handle.close().await;
        Ok(())
    }

    async fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_identity() {
        let a = CacheKey::new("host", 22, "user", None);
        let b = CacheKey::new("host", 22, "user", None);
        let c = CacheKey::new("host", 22, "user", Some("nc %h %p"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "user@host:22:-");
        assert_eq!(c.to_string(), "user@host:22:nc %h %p");
    }

    #[test]
    fn test_cache_display() {
        let cache = ConnectionCache::with_limits("commands", Duration::from_secs(2), 4);
        let text = cache.to_string();
        assert!(text.contains("commands"));
        assert!(text.contains("max_channels=4"));
    }

    #[tokio::test]
    async fn test_empty_cache_stats() {
        let cache = ConnectionCache::new("empty");
        let stats = cache.stats().await;
        assert_eq!(stats.handles, 0);
        assert_eq!(stats.channels_in_use, 0);
        assert_eq!(stats.pending_timers, 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_cache_is_harmless() {
        let cache = ConnectionCache::new("empty");
        cache.flush().await;
        assert_eq!(cache.stats().await.handles, 0);
    }
}
