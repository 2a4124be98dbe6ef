//! Per-host pool of established probing sessions.
//!
//! Each `host:port` gets its own bounded set of sessions. A checkout holds
//! a semaphore permit for its whole lifetime, so a host never has more
//! than `max_connections_per_host` sessions in use and a session is never
//! handed to two callers at once.
//!
//! # Example
//!
//! ```ignore
//! use mxprobe_smtp::pool::{ConnectionPool, PoolConfig, TcpTransport};
//!
//! let pool = ConnectionPool::new(TcpTransport, session_config, PoolConfig::default());
//! let mut conn = pool.get_connection("mx.example.com", 25, timeout, false).await?;
//! let outcomes = conn.session_mut().probe_rcpt_batch(&recipients).await?;
//! pool.release_connection(conn).await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::connection::{ProbeSession, SessionConfig};
use crate::error::{Error, Result};

/// Default maximum sessions per `host:port`.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;

/// Default idle time after which a pooled session is stale.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between stale-session sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default time to wait for a free slot.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the byte stream a session runs over.
pub trait Transport: Send + Sync + 'static {
    /// Stream type produced by [`Transport::open`].
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connects to `host:port`.
    fn open(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn open(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Pool sizing and lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum sessions per `host:port`.
    pub max_connections_per_host: usize,
    /// Idle time after which a session is stale.
    pub idle_timeout: Duration,
    /// Interval between background sweeps.
    pub sweep_interval: Duration,
    /// Time to wait for a free slot before giving up.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Sets the per-host limit (at least 1).
    #[must_use]
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max.max(1);
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the slot wait timeout.
    #[must_use]
    pub const fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open sessions.
    pub total: usize,
    /// Sessions currently checked out.
    pub in_use: usize,
    /// Idle sessions that can be reused.
    pub available: usize,
    /// Idle sessions past the idle timeout.
    pub stale: usize,
}

/// Returns the pool key for a host and port.
#[must_use]
pub fn pool_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Decrements the host's open count when the session it belongs to drops.
#[derive(Debug)]
struct OpenSlot(Arc<AtomicUsize>);

impl OpenSlot {
    fn acquire(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(open))
    }
}

impl Drop for OpenSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Entry<S> {
    id: u64,
    session: ProbeSession<S>,
    created_at: Instant,
    last_used: Instant,
    _slot: OpenSlot,
}

impl<S> Entry<S> {
    fn is_healthy(&self, idle_timeout: Duration) -> bool {
        self.session.is_connected() && self.last_used.elapsed() < idle_timeout
    }
}

struct HostPool<S> {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Entry<S>>>,
    open: Arc<AtomicUsize>,
}

impl<S> HostPool<S> {
    fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Entry<S>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session checked out of the pool.
///
/// Return it with [`ConnectionPool::release_connection`]. Dropping it
/// instead closes the session and frees the slot.
#[derive(Debug)]
pub struct PooledConnection<S> {
    entry: Entry<S>,
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl<S> PooledConnection<S> {
    /// Unique id of the underlying session within the pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.entry.id
    }

    /// Pool key (`host:port`).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// When the session was established.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.entry.created_at
    }

    /// When the session was last handed out or returned.
    #[must_use]
    pub const fn last_used_at(&self) -> Instant {
        self.entry.last_used
    }

    /// The session.
    #[must_use]
    pub const fn session(&self) -> &ProbeSession<S> {
        &self.entry.session
    }

    /// The session, mutably.
    pub const fn session_mut(&mut self) -> &mut ProbeSession<S> {
        &mut self.entry.session
    }
}

/// Bounded per-host pool of probing sessions.
pub struct ConnectionPool<T: Transport> {
    transport: T,
    session: Arc<SessionConfig>,
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Arc<HostPool<T::Stream>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T: Transport> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(transport: T, session: Arc<SessionConfig>, config: PoolConfig) -> Self {
        Self {
            transport,
            session,
            config,
            hosts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool settings.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Session settings used for new connections.
    #[must_use]
    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    /// Returns true once [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, Arc<HostPool<T::Stream>>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_pool(&self, key: &str) -> Arc<HostPool<T::Stream>> {
        let mut hosts = self.hosts();
        Arc::clone(
            hosts
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(HostPool::new(self.config.max_connections_per_host))),
        )
    }

    /// Checks out a session for `host:port`.
    ///
    /// Reuses a healthy idle session when one exists, otherwise connects
    /// (bounded by `connect_timeout`) and runs the SMTP handshake. When the
    /// host is at its limit this waits for a release, up to the pool's
    /// wait timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no slot frees up in time,
    /// [`Error::InvalidState`] if the pool is closed, and any connect or
    /// handshake error otherwise.
    pub async fn get_connection(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        use_tls: bool,
    ) -> Result<PooledConnection<T::Stream>> {
        if self.is_closed() {
            return Err(Error::InvalidState("connection pool is closed".into()));
        }

        let key = pool_key(host, port);
        let host_pool = self.host_pool(&key);

        let permit = tokio::time::timeout(
            self.config.wait_timeout,
            Arc::clone(&host_pool.permits).acquire_owned(),
        )
        .await
        .map_err(|_| Error::PoolExhausted { key: key.clone() })?
        .map_err(|_| Error::InvalidState("connection pool is closed".into()))?;

        let mut stale = Vec::new();
        let reused = {
            let mut idle = host_pool.idle();
            loop {
                match idle.pop() {
                    Some(entry) if entry.is_healthy(self.config.idle_timeout) => break Some(entry),
                    Some(entry) => stale.push(entry),
                    None => break None,
                }
            }
        };
        for mut entry in stale {
            tracing::debug!(key = %key, id = entry.id, "discarding stale session");
            entry.session.close().await;
        }

        if let Some(mut entry) = reused {
            tracing::trace!(key = %key, id = entry.id, "reusing pooled session");
            entry.last_used = Instant::now();
            return Ok(PooledConnection {
                entry,
                key,
                _permit: permit,
            });
        }

        let stream = tokio::time::timeout(connect_timeout, self.transport.open(host, port))
            .await
            .map_err(|_| Error::timeout("connect"))??;
        let session =
            ProbeSession::handshake(stream, host, port, Arc::clone(&self.session), use_tls).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        tracing::debug!(key = %key, id, "opened new session");

        Ok(PooledConnection {
            entry: Entry {
                id,
                session,
                created_at: now,
                last_used: now,
                _slot: OpenSlot::acquire(&host_pool.open),
            },
            key,
            _permit: permit,
        })
    }

    /// Returns a session to the pool.
    ///
    /// A session with an open transaction is reset first. Sessions that
    /// are disconnected, fail the reset, or come back after the pool was
    /// closed are closed instead of pooled.
    pub async fn release_connection(&self, conn: PooledConnection<T::Stream>) {
        let PooledConnection {
            mut entry,
            key,
            _permit: permit,
        } = conn;

        if self.is_closed() || !entry.session.is_connected() {
            entry.session.close().await;
            return;
        }

        if entry.session.has_open_transaction() {
            if let Err(e) = entry.session.reset().await {
                tracing::debug!(key = %key, id = entry.id, error = %e, "reset failed, dropping session");
                entry.session.close().await;
                return;
            }
        }

        entry.last_used = Instant::now();
        let host_pool = self.host_pool(&key);
        host_pool.idle().push(entry);
        drop(permit);
    }

    /// Closes idle sessions past the idle timeout and forgets hosts with
    /// no sessions left. Returns the number of sessions closed.
    pub async fn sweep_stale(&self) -> usize {
        let pools: Vec<Arc<HostPool<T::Stream>>> = self.hosts().values().cloned().collect();

        let mut evicted = 0;
        for pool in pools {
            let stale: Vec<Entry<T::Stream>> = {
                let mut idle = pool.idle();
                let (keep, stale) = std::mem::take(&mut *idle)
                    .into_iter()
                    .partition(|entry| entry.is_healthy(self.config.idle_timeout));
                *idle = keep;
                stale
            };
            evicted += stale.len();
            for mut entry in stale {
                entry.session.close().await;
            }
        }

        self.hosts()
            .retain(|_, pool| Arc::strong_count(pool) > 1 || pool.open.load(Ordering::SeqCst) > 0);

        if evicted > 0 {
            tracing::debug!(evicted, "swept stale sessions");
        }
        evicted
    }

    /// Current occupancy across all hosts.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats_by_key()
            .into_values()
            .fold(PoolStats::default(), |mut acc, stats| {
                acc.total += stats.total;
                acc.in_use += stats.in_use;
                acc.available += stats.available;
                acc.stale += stats.stale;
                acc
            })
    }

    /// Occupancy per `host:port` key.
    #[must_use]
    pub fn stats_by_key(&self) -> BTreeMap<String, PoolStats> {
        let hosts = self.hosts();
        hosts
            .iter()
            .map(|(key, pool)| {
                let open = pool.open.load(Ordering::SeqCst);
                let idle = pool.idle();
                let available = idle
                    .iter()
                    .filter(|entry| entry.is_healthy(self.config.idle_timeout))
                    .count();
                let stats = PoolStats {
                    total: open,
                    in_use: open.saturating_sub(idle.len()),
                    available,
                    stale: idle.len() - available,
                };
                (key.clone(), stats)
            })
            .collect()
    }

    /// Closes every idle session and refuses further checkouts.
    ///
    /// Sessions still checked out are closed when they are released.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<HostPool<T::Stream>>> =
            self.hosts().drain().map(|(_, pool)| pool).collect();

        for pool in pools {
            pool.permits.close();
            let idle = std::mem::take(&mut *pool.idle());
            for mut entry in idle {
                entry.session.close().await;
            }
        }
        tracing::debug!("connection pool closed");
    }

    /// Runs [`Self::sweep_stale`] every sweep interval until the pool is
    /// closed or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_closed() {
                    break;
                }
                pool.sweep_stale().await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::quirks::ProviderThrottle;
    use std::collections::HashSet;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// In-memory transport; every open spawns a scripted SMTP responder.
    #[derive(Default)]
    struct MemoryTransport {
        opened: Arc<AtomicUsize>,
    }

    impl Transport for MemoryTransport {
        type Stream = DuplexStream;

        async fn open(&self, _host: &str, _port: u16) -> io::Result<DuplexStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(respond(server));
            Ok(client)
        }
    }

    async fn respond(stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        if write.write_all(b"220 fake ESMTP\r\n").await.is_err() {
            return;
        }
        while let Ok(Some(line)) = lines.next_line().await {
            let reply: &[u8] = match line.split_whitespace().next().unwrap_or("") {
                "EHLO" => b"250-fake\r\n250 PIPELINING\r\n",
                "QUIT" => {
                    let _ = write.write_all(b"221 bye\r\n").await;
                    return;
                }
                _ => b"250 OK\r\n",
            };
            if write.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    fn pool(config: PoolConfig) -> ConnectionPool<MemoryTransport> {
        let session = SessionConfig::new("probe@example.com")
            .unwrap()
            .throttle(ProviderThrottle::disabled());
        ConnectionPool::new(MemoryTransport::default(), Arc::new(session), config)
    }

    const CONNECT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn released_session_is_reused() {
        let pool = pool(PoolConfig::default());
        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        let first = conn.id();
        pool.release_connection(conn).await;

        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        assert_eq!(conn.id(), first);
        assert_eq!(pool.transport.opened.load(Ordering::SeqCst), 1);
        assert_eq!(conn.key(), "mx.test:25");
    }

    #[tokio::test]
    async fn hosts_are_pooled_separately() {
        let pool = pool(PoolConfig::default());
        let a = pool.get_connection("a.test", 25, CONNECT, false).await.unwrap();
        let b = pool.get_connection("b.test", 25, CONNECT, false).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().in_use, 2);

        pool.release_connection(b).await;
        let by_key = pool.stats_by_key();
        assert_eq!(by_key["a.test:25"].in_use, 1);
        assert_eq!(by_key["b.test:25"].available, 1);
        drop(a);
    }

    #[tokio::test]
    async fn exhausted_host_times_out() {
        let pool = pool(
            PoolConfig::default()
                .max_connections_per_host(1)
                .wait_timeout(Duration::from_millis(50)),
        );
        let held = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        let err = pool
            .get_connection("mx.test", 25, CONNECT, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { ref key } if key == "mx.test:25"));

        pool.release_connection(held).await;
        assert!(pool.get_connection("mx.test", 25, CONNECT, false).await.is_ok());
    }

    #[tokio::test]
    async fn never_hands_out_a_session_twice() {
        let pool = Arc::new(pool(PoolConfig::default().max_connections_per_host(2)));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
                {
                    let mut held = in_use.lock().unwrap();
                    assert!(held.insert(conn.id()), "session {} checked out twice", conn.id());
                    assert!(held.len() <= 2);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.lock().unwrap().remove(&conn.id());
                pool.release_connection(conn).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(pool.transport.opened.load(Ordering::SeqCst) <= 2);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert!(stats.total <= 2);
    }

    #[tokio::test]
    async fn probe_then_release_resets_transaction() {
        let pool = pool(PoolConfig::default());
        let mut conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        let outcomes = conn
            .session_mut()
            .probe_rcpt_batch(&["a@example.org".to_string()])
            .await
            .unwrap();
        assert_eq!(outcomes[0].response.code, 250);
        assert!(conn.session().has_open_transaction());

        pool.release_connection(conn).await;
        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        assert!(!conn.session().has_open_transaction());
    }

    #[tokio::test]
    async fn sweep_evicts_stale_sessions() {
        let pool = pool(PoolConfig::default().idle_timeout(Duration::from_millis(10)));
        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        pool.release_connection(conn).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.stats().stale, 1);
        assert_eq!(pool.sweep_stale().await, 1);

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available, 0);
    }

    #[tokio::test]
    async fn dropped_checkout_frees_slot() {
        let pool = pool(
            PoolConfig::default()
                .max_connections_per_host(1)
                .wait_timeout(Duration::from_millis(200)),
        );
        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        drop(conn);
        assert_eq!(pool.stats().total, 0);
        assert!(pool.get_connection("mx.test", 25, CONNECT, false).await.is_ok());
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkout() {
        let pool = pool(PoolConfig::default());
        let conn = pool.get_connection("mx.test", 25, CONNECT, false).await.unwrap();
        pool.release_connection(conn).await;
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(
            pool.get_connection("mx.test", 25, CONNECT, false).await,
            Err(Error::InvalidState(_))
        ));
    }
}
