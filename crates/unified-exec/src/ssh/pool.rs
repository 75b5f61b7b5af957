//! Reference-counted connection pool for SSH transports
//!
//! Connections are keyed by `(host, port, username, credential fingerprint)`
//! and move through `Connecting → Ready → Idle → Closing → Closed`. A
//! connection is `Idle` only while nothing references it, is evicted only
//! after `idle_timeout` in that state, and is never handed out once it is
//! `Closing` or `Closed`. All state transitions happen under one lock.
//!
//! Eviction and keep-alive run as detached tasks that hold a weak reference
//! to the pool. A per-connection generation counter invalidates pending
//! eviction when the connection is acquired again.

use crate::error::{Error, Result};
use crate::options::PoolOptions;
use async_trait::async_trait;
use smol::Timer;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const ACQUIRE_POLL: Duration = Duration::from_millis(20);

/// Identity of a pooled connection
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnectionKey {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Fingerprint of the credentials used to authenticate
    pub fingerprint: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}#{}",
            self.username, self.host, self.port, self.fingerprint
        )
    }
}

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Being established
    Connecting,
    /// Established and referenced
    Ready,
    /// Established and unreferenced; eviction pending
    Idle,
    /// Being torn down; no new references
    Closing,
    /// Torn down
    Closed,
}

/// A connection the pool can manage
#[async_trait]
pub trait PooledConnection: Send + Sync + 'static {
    /// Whether the connection is still usable
    async fn probe(&self) -> bool;

    /// Tear the connection down
    async fn close(&self);
}

struct Entry<C> {
    id: u64,
    state: ConnectionState,
    ref_count: usize,
    last_used_at: Instant,
    generation: u64,
    conn: Option<Arc<C>>,
}

impl<C> Entry<C> {
    fn usable(&self) -> bool {
        matches!(self.state, ConnectionState::Ready | ConnectionState::Idle) && self.conn.is_some()
    }

    fn live(&self) -> bool {
        !matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }
}

struct Slot<C> {
    settings: PoolOptions,
    entries: Vec<Entry<C>>,
}

struct Shared<C> {
    slots: Mutex<HashMap<ConnectionKey, Slot<C>>>,
    next_id: AtomicU64,
}

enum Attempt<C: PooledConnection> {
    Leased(ConnectionLease<C>),
    Create(u64),
    Wait,
}

/// Pool summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Distinct identity keys
    pub keys: usize,
    /// Connections in any state
    pub connections: usize,
    /// Connections being established
    pub connecting: usize,
    /// Referenced connections
    pub ready: usize,
    /// Unreferenced connections awaiting eviction
    pub idle: usize,
    /// Connections being torn down
    pub closing: usize,
    /// Outstanding leases
    pub leases: usize,
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Pool-assigned id
    pub id: u64,
    /// Current state
    pub state: ConnectionState,
    /// Outstanding leases
    pub ref_count: usize,
    /// Time since the connection was last acquired or released
    pub idle_for: Duration,
}

/// Connection pool keyed by [`ConnectionKey`]
pub struct ConnectionPool<C: PooledConnection> {
    shared: Arc<Shared<C>>,
}

impl<C: PooledConnection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PooledConnection> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PooledConnection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: PooledConnection> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Slot<C>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(self: &Arc<Self>, key: &ConnectionKey, id: u64) {
        let mut evict_after = None;
        let mut to_close = None;
        {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            let idle_timeout = slot.settings.idle_timeout();
            if let Some(pos) = slot.entries.iter().position(|e| e.id == id) {
                let entry = &mut slot.entries[pos];
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.last_used_at = Instant::now();
                if entry.ref_count == 0 {
                    match entry.state {
                        ConnectionState::Ready => {
                            entry.state = ConnectionState::Idle;
                            entry.generation += 1;
                            evict_after = Some((entry.generation, idle_timeout));
                        }
                        ConnectionState::Closing | ConnectionState::Closed => {
                            to_close = slot.entries.remove(pos).conn;
                        }
                        ConnectionState::Connecting | ConnectionState::Idle => {}
                    }
                }
            }
            if slot.entries.is_empty() {
                slots.remove(key);
            }
        }

        if let Some((generation, idle_timeout)) = evict_after {
            trace!("connection {} to {} is idle", id, key);
            smol::spawn(evict_after_idle(
                Arc::downgrade(self),
                key.clone(),
                id,
                generation,
                idle_timeout,
            ))
            .detach();
        }
        if let Some(conn) = to_close {
            debug!("closing released connection {} to {}", id, key);
            smol::spawn(async move { conn.close().await }).detach();
        }
    }

    /// Drop a connection whose connect attempt did not complete
    fn abandon(&self, key: &ConnectionKey, id: u64) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.entries.retain(|e| e.id != id);
            if slot.entries.is_empty() {
                slots.remove(key);
            }
        }
    }

    /// Mark a connection broken; returns it if nothing references it anymore
    fn mark_broken(&self, key: &ConnectionKey, id: u64) -> Option<Arc<C>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(key)?;
        let pos = slot.entries.iter().position(|e| e.id == id)?;
        let entry = &mut slot.entries[pos];
        entry.state = ConnectionState::Closed;
        entry.generation += 1;
        let conn = if entry.ref_count == 0 {
            slot.entries.remove(pos).conn
        } else {
            None
        };
        if slot.entries.is_empty() {
            slots.remove(key);
        }
        conn
    }
}

async fn evict_after_idle<C: PooledConnection>(
    shared: Weak<Shared<C>>,
    key: ConnectionKey,
    id: u64,
    generation: u64,
    idle_timeout: Duration,
) {
    Timer::after(idle_timeout).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let conn = {
        let mut slots = shared.lock();
        let Some(slot) = slots.get_mut(&key) else {
            return;
        };
        let Some(pos) = slot.entries.iter().position(|e| {
            e.id == id
                && e.generation == generation
                && e.state == ConnectionState::Idle
                && e.ref_count == 0
        }) else {
            return;
        };
        slot.entries[pos].state = ConnectionState::Closing;
        let conn = slot.entries.remove(pos).conn;
        if slot.entries.is_empty() {
            slots.remove(&key);
        }
        conn
    };
    if let Some(conn) = conn {
        debug!("evicting connection {} to {} after {:?} idle", id, key, idle_timeout);
        conn.close().await;
    }
}

async fn keep_alive<C: PooledConnection>(
    shared: Weak<Shared<C>>,
    key: ConnectionKey,
    id: u64,
    interval: Duration,
) {
    loop {
        Timer::after(interval).await;
        let Some(pool) = shared.upgrade() else {
            return;
        };
        let conn = {
            let slots = pool.lock();
            let entry = slots
                .get(&key)
                .and_then(|slot| slot.entries.iter().find(|e| e.id == id));
            match entry {
                Some(entry) if entry.usable() => entry.conn.clone(),
                _ => return,
            }
        };
        let Some(conn) = conn else {
            return;
        };
        if conn.probe().await {
            trace!("keep-alive ok for connection {} to {}", id, key);
            continue;
        }
        warn!("keep-alive probe failed for connection {} to {}", id, key);
        if let Some(conn) = pool.mark_broken(&key, id) {
            conn.close().await;
        }
        return;
    }
}

/// Removes a `Connecting` entry if the connect future is dropped or fails
struct ConnectingGuard<'a, C: PooledConnection> {
    shared: &'a Shared<C>,
    key: &'a ConnectionKey,
    id: u64,
    armed: bool,
}

impl<C: PooledConnection> Drop for ConnectingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.key, self.id);
        }
    }
}

impl<C: PooledConnection> ConnectionPool<C> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lease(&self, key: &ConnectionKey, entry: &Entry<C>, conn: Arc<C>) -> ConnectionLease<C> {
        ConnectionLease {
            shared: self.shared.clone(),
            key: key.clone(),
            id: entry.id,
            conn,
            released: false,
        }
    }

    fn try_acquire(&self, key: &ConnectionKey, settings: &PoolOptions) -> Attempt<C> {
        let mut slots = self.shared.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            settings: settings.clone(),
            entries: Vec::new(),
        });
        slot.settings = settings.clone();

        let now = Instant::now();
        if let Some(entry) = slot
            .entries
            .iter_mut()
            .filter(|e| e.usable() && e.ref_count == 0)
            .max_by_key(|e| e.last_used_at)
        {
            entry.ref_count += 1;
            entry.state = ConnectionState::Ready;
            entry.generation += 1;
            entry.last_used_at = now;
            if let Some(conn) = entry.conn.clone() {
                trace!("reusing connection {} to {}", entry.id, key);
                return Attempt::Leased(self.lease(key, entry, conn));
            }
        }

        let live = slot.entries.iter().filter(|e| e.live()).count();
        if live < settings.max_connections.max(1) {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            slot.entries.push(Entry {
                id,
                state: ConnectionState::Connecting,
                ref_count: 1,
                last_used_at: now,
                generation: 0,
                conn: None,
            });
            return Attempt::Create(id);
        }

        if let Some(entry) = slot
            .entries
            .iter_mut()
            .filter(|e| e.usable())
            .min_by_key(|e| e.ref_count)
        {
            entry.ref_count += 1;
            entry.state = ConnectionState::Ready;
            entry.generation += 1;
            entry.last_used_at = now;
            if let Some(conn) = entry.conn.clone() {
                trace!(
                    "sharing connection {} to {} ({} leases)",
                    entry.id, key, entry.ref_count
                );
                return Attempt::Leased(self.lease(key, entry, conn));
            }
        }

        Attempt::Wait
    }

    /// Lease a connection for `key`, creating one with `create` when needed
    ///
    /// Reuses an unreferenced connection first, creates a new one while under
    /// `max_connections`, then shares the least loaded one. When every
    /// connection is still being established, waits up to `wait_bound`.
    /// Failed connects are never cached.
    pub async fn acquire<F, Fut>(
        &self,
        key: ConnectionKey,
        settings: &PoolOptions,
        wait_bound: Duration,
        create: F,
    ) -> Result<ConnectionLease<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let start = Instant::now();
        let id = loop {
            match self.try_acquire(&key, settings) {
                Attempt::Leased(lease) => return Ok(lease),
                Attempt::Create(id) => break id,
                Attempt::Wait => {
                    if start.elapsed() >= wait_bound {
                        return Err(Error::connection(
                            key.host.clone(),
                            format!(
                                "no pooled connection to {} became ready within {:?}",
                                key, wait_bound
                            ),
                        ));
                    }
                    Timer::after(ACQUIRE_POLL).await;
                }
            }
        };

        let mut guard = ConnectingGuard {
            shared: &self.shared,
            key: &key,
            id,
            armed: true,
        };
        debug!("opening connection {} to {}", id, key);
        let conn = match create().await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                debug!("connection {} to {} failed: {}", id, key, e);
                return Err(e);
            }
        };
        guard.armed = false;

        let (lease, keep_alive_every) = {
            let mut slots = self.shared.lock();
            let entry = slots
                .get_mut(&key)
                .and_then(|slot| slot.entries.iter_mut().find(|e| e.id == id));
            match entry {
                Some(entry) if entry.state == ConnectionState::Connecting => {
                    entry.state = ConnectionState::Ready;
                    entry.conn = Some(conn.clone());
                    entry.last_used_at = Instant::now();
                    let lease = self.lease(&key, entry, conn.clone());
                    let keep_alive_every = settings
                        .keep_alive
                        .then(|| settings.keep_alive_interval());
                    (Some(lease), keep_alive_every)
                }
                _ => (None, None),
            }
        };

        let Some(lease) = lease else {
            // Pool was closed while connecting
            self.shared.abandon(&key, id);
            conn.close().await;
            return Err(Error::connection(
                key.host.clone(),
                "connection pool closed while connecting",
            ));
        };
        if let Some(interval) = keep_alive_every {
            smol::spawn(keep_alive(
                Arc::downgrade(&self.shared),
                key.clone(),
                id,
                interval,
            ))
            .detach();
        }
        Ok(lease)
    }

    /// Close every connection; referenced ones close when their last lease is released
    pub async fn close_all(&self) {
        let to_close: Vec<Arc<C>> = {
            let mut slots = self.shared.lock();
            let mut to_close = Vec::new();
            for slot in slots.values_mut() {
                let mut kept = Vec::new();
                for mut entry in slot.entries.drain(..) {
                    entry.generation += 1;
                    if entry.ref_count == 0 {
                        entry.state = ConnectionState::Closed;
                        to_close.extend(entry.conn.take());
                    } else {
                        entry.state = ConnectionState::Closing;
                        kept.push(entry);
                    }
                }
                slot.entries = kept;
            }
            slots.retain(|_, slot| !slot.entries.is_empty());
            to_close
        };
        if !to_close.is_empty() {
            debug!("closing {} pooled connections", to_close.len());
        }
        for conn in to_close {
            conn.close().await;
        }
    }

    /// Pool summary
    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.lock();
        let mut stats = PoolStats {
            keys: slots.len(),
            ..PoolStats::default()
        };
        for entry in slots.values().flat_map(|s| s.entries.iter()) {
            stats.connections += 1;
            stats.leases += entry.ref_count;
            match entry.state {
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Ready => stats.ready += 1,
                ConnectionState::Idle => stats.idle += 1,
                ConnectionState::Closing | ConnectionState::Closed => stats.closing += 1,
            }
        }
        stats
    }

    /// Connections for one key
    pub fn snapshot(&self, key: &ConnectionKey) -> Vec<ConnectionSnapshot> {
        let slots = self.shared.lock();
        slots
            .get(key)
            .map(|slot| {
                slot.entries
                    .iter()
                    .map(|e| ConnectionSnapshot {
                        id: e.id,
                        state: e.state,
                        ref_count: e.ref_count,
                        idle_for: e.last_used_at.elapsed(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A reference to a pooled connection; released on drop
pub struct ConnectionLease<C: PooledConnection> {
    shared: Arc<Shared<C>>,
    key: ConnectionKey,
    id: u64,
    conn: Arc<C>,
    released: bool,
}

impl<C: PooledConnection> ConnectionLease<C> {
    /// The leased connection
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    /// Pool-assigned connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The identity key
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.released = true;
        self.shared.release(&self.key, self.id);
    }
}

impl<C: PooledConnection> fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl<C: PooledConnection> Drop for ConnectionLease<C> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        closed: AtomicUsize,
        probes: AtomicUsize,
        healthy: AtomicBool,
    }

    struct FakeConnection {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl PooledConnection for FakeConnection {
        async fn probe(&self) -> bool {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            self.counters.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> ConnectionKey {
        ConnectionKey {
            host: "db.internal".to_string(),
            port: 22,
            username: "deploy".to_string(),
            fingerprint: "abc123".to_string(),
        }
    }

    fn settings(max: usize, idle_ms: u64) -> PoolOptions {
        PoolOptions {
            enabled: true,
            max_connections: max,
            idle_timeout_ms: idle_ms,
            keep_alive: false,
            keep_alive_interval_ms: 30_000,
        }
    }

    async fn acquire(
        pool: &ConnectionPool<FakeConnection>,
        counters: &Arc<Counters>,
        settings: &PoolOptions,
    ) -> Result<ConnectionLease<FakeConnection>> {
        let counters = counters.clone();
        pool.acquire(key(), settings, Duration::from_secs(5), || async move {
            Timer::after(Duration::from_millis(10)).await;
            counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection { counters })
        })
        .await
    }

    #[smol_potat::test]
    async fn test_released_connection_is_reused() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let settings = settings(4, 60_000);

        let first = acquire(&pool, &counters, &settings).await.unwrap();
        let first_id = first.id();
        drop(first);
        assert_eq!(pool.stats().idle, 1);

        let second = acquire(&pool, &counters, &settings).await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().ready, 1);
    }

    #[smol_potat::test]
    async fn test_concurrent_acquires_respect_max_connections() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let settings = settings(2, 60_000);

        let leases = futures::future::join_all(
            (0..6).map(|_| acquire(&pool, &counters, &settings)),
        )
        .await;
        let leases: Vec<_> = leases.into_iter().collect::<Result<_>>().unwrap();

        assert!(counters.created.load(Ordering::SeqCst) <= 2);
        let stats = pool.stats();
        assert!(stats.connections <= 2);
        assert_eq!(stats.leases, 6);
        drop(leases);
        assert_eq!(pool.stats().leases, 0);
    }

    #[smol_potat::test]
    async fn test_idle_connection_is_evicted() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let settings = settings(2, 50);

        let lease = acquire(&pool, &counters, &settings).await.unwrap();
        let first_id = lease.id();
        lease.release();
        Timer::after(Duration::from_millis(300)).await;

        assert_eq!(pool.stats().connections, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        let lease = acquire(&pool, &counters, &settings).await.unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_ne!(lease.id(), first_id);
        assert_eq!(pool.stats().connections, 1);
        drop(lease);
    }

    #[smol_potat::test]
    async fn test_held_connection_is_never_evicted() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let settings = settings(2, 80);

        let lease = acquire(&pool, &counters, &settings).await.unwrap();
        drop(lease);
        Timer::after(Duration::from_millis(20)).await;
        let held = acquire(&pool, &counters, &settings).await.unwrap();
        Timer::after(Duration::from_millis(300)).await;

        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
        let snapshot = pool.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, ConnectionState::Ready);
        assert_eq!(snapshot[0].ref_count, 1);
        drop(held);
    }

    #[smol_potat::test]
    async fn test_failed_connect_is_not_cached() {
        let pool: ConnectionPool<FakeConnection> = ConnectionPool::new();
        let err = pool
            .acquire(key(), &settings(2, 60_000), Duration::from_secs(1), || async {
                Err(Error::connection("db.internal", "Connection refused"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(pool.stats(), PoolStats::default());

        let counters = Arc::new(Counters::default());
        assert!(acquire(&pool, &counters, &settings(2, 60_000)).await.is_ok());
    }

    #[smol_potat::test]
    async fn test_failed_keep_alive_removes_connection() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let mut settings = settings(2, 60_000);
        settings.keep_alive = true;
        settings.keep_alive_interval_ms = 30;

        let lease = acquire(&pool, &counters, &settings).await.unwrap();
        drop(lease);
        Timer::after(Duration::from_millis(200)).await;

        assert!(counters.probes.load(Ordering::SeqCst) >= 1);
        assert_eq!(pool.stats().connections, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[smol_potat::test]
    async fn test_close_all_defers_held_connections() {
        let pool = ConnectionPool::new();
        let counters = Arc::new(Counters::default());
        let settings = settings(2, 60_000);

        let held = acquire(&pool, &counters, &settings).await.unwrap();
        let idle = acquire(&pool, &counters, &settings).await.unwrap();
        drop(idle);

        pool.close_all().await;
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().closing, 1);

        drop(held);
        Timer::after(Duration::from_millis(50)).await;
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
