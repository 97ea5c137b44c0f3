//! Bounded pool of [`Connection`]s.
//!
//! A pool lends each connection to exactly one borrower at a time. The
//! borrower gets a [`PooledConnection`] guard; dropping the guard hands the
//! connection back. Capacity is enforced with a semaphore holding one permit
//! per connection slot, so a borrower that finds the pool full simply waits
//! for a permit, up to the configured borrow timeout.
//!
//! Connections are only recycled when they come back in the `Ready` state.
//! Anything else (closed by an I/O error, left subscribed, stuck inside a
//! transaction, or belonging to an endpoint list that was replaced by
//! [`failover_to`](ConnectionPool::failover_to)) is dropped and its slot
//! freed.

use crate::config::{Endpoint, PoolConfig, Selection};
use crate::{Connection, Error, Result};

use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

/// Handle to a pool. Cloning is cheap and every clone refers to the same
/// pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,

    // 每个许可代表一个连接槽位
    permits: Arc<Semaphore>,

    // 只在移动空闲连接和更新计数时持有
    state: Mutex<PoolState>,
}

struct PoolState {
    idle: VecDeque<Connection>,

    endpoints: Vec<Endpoint>,

    /// Round robin cursor into `endpoints`.
    next: usize,

    /// Bumped by `failover_to`; connections borrowed under an older
    /// generation are not taken back.
    generation: u64,

    created: u64,

    discarded: u64,

    closed: bool,
}

/// Point in time snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections dropped instead of being recycled.
    pub discarded: u64,
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first borrow.
    pub fn new(config: PoolConfig) -> Result<ConnectionPool> {
        config.validate()?;

        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            endpoints: config.endpoints.clone(),
            next: 0,
            generation: 0,
            created: 0,
            discarded: 0,
            closed: false,
        };

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                config,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection for exclusive use.
    ///
    /// Waits up to the borrow timeout for a free slot. An idle connection
    /// that has not been used for longer than the idle check threshold is
    /// pinged first and reconnected if the ping fails.
    ///
    /// # Errors
    ///
    /// * `PoolExhausted` when no slot frees up in time.
    /// * `PoolClosed` once [`close`](ConnectionPool::close) was called.
    /// * A connection-class error when no connection could be opened.
    #[instrument(skip(self))]
    pub async fn borrow(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let acquire = self.inner.permits.clone().acquire_owned();

        let permit = match time::timeout(self.inner.config.borrow_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            // semaphore 只有在 close() 时才会被关闭
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                let waited = started.elapsed();
                warn!(?waited, max_size = self.inner.config.max_size, "connection pool exhausted");
                return Err(Error::PoolExhausted { waited });
            }
        };

        let generation = self.lock().generation;
        // 失败时 permit 在这里被释放
        let conn = self.checkout().await?;

        debug!(id = conn.id(), generation, "connection borrowed");
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            generation,
            _permit: permit,
        })
    }

    /// Replace the endpoint list, for example after a primary changed.
    ///
    /// Idle connections are dropped right away. Connections currently lent
    /// out are dropped when they come back.
    pub fn failover_to(&self, endpoints: Vec<Endpoint>) -> Result<()> {
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoint to fail over to".into()));
        }

        let stale = {
            let mut state = self.lock();
            state.endpoints = endpoints;
            state.next = 0;
            state.generation += 1;
            let stale: Vec<Connection> = state.idle.drain(..).collect();
            state.discarded += stale.len() as u64;
            info!(generation = state.generation, endpoints = ?state.endpoints, "pool failed over");
            stale
        };
        drop(stale);
        Ok(())
    }

    /// Close the pool. Idle connections are dropped, pending and future
    /// borrows fail with `PoolClosed`, returned connections are dropped.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            state.discarded += idle.len() as u64;
            idle
        };
        self.inner.permits.close();
        drop(idle);
        info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let max_size = self.inner.config.max_size;
        PoolStats {
            max_size,
            idle: state.idle.len(),
            in_use: max_size.saturating_sub(self.inner.permits.available_permits()),
            created: state.created,
            discarded: state.discarded,
        }
    }

    /// Take an idle connection, or open a new one.
    async fn checkout(&self) -> Result<Connection> {
        loop {
            let idle = self.lock().idle.pop_front();
            let mut conn = match idle {
                Some(conn) => conn,
                None => break,
            };

            if !conn.is_ready() {
                self.inner.discard(conn, "not ready");
                continue;
            }

            if conn.idle_for() >= self.inner.config.idle_check_after {
                if let Err(err) = self.health_check(&mut conn).await {
                    self.inner.discard(conn, "health check failed");
                    return Err(err);
                }
            }
            return Ok(conn);
        }

        self.open_connection().await
    }

    async fn health_check(&self, conn: &mut Connection) -> Result<()> {
        // 读超时默认不设上限，健康检查必须有自己的期限
        let limit = self.inner.config.connection.timeouts.health_check();
        match conn.ping_within(Some(limit)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(id = conn.id(), cause = %err, "idle connection failed health check, reconnecting");
                conn.reconnect().await
            }
        }
    }

    /// Connect to the first reachable endpoint, in selection order.
    async fn open_connection(&self) -> Result<Connection> {
        let candidates = {
            let mut state = self.lock();
            state.candidates(self.inner.config.selection)
        };

        let mut last_err = Error::InvalidConfig("no endpoint configured".into());
        for endpoint in candidates {
            let options = self.inner.config.connection.clone();
            match Connection::connect(endpoint.clone(), options).await {
                Ok(conn) => {
                    self.lock().created += 1;
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, cause = %err, "failed to open connection");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // 持锁期间不会panic，被污染的数据依然一致
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, conn: Connection, generation: u64) {
        let mut state = self.lock();
        let reason = if state.closed {
            "pool closed"
        } else if state.generation != generation {
            "stale generation"
        } else if !conn.is_ready() {
            "not ready"
        } else {
            debug!(id = conn.id(), "connection returned");
            state.idle.push_back(conn);
            return;
        };
        state.discarded += 1;
        drop(state);

        debug!(id = conn.id(), state = ?conn.state(), reason, "connection discarded");
    }

    fn discard(&self, conn: Connection, reason: &'static str) {
        self.lock().discarded += 1;
        debug!(id = conn.id(), state = ?conn.state(), reason, "connection discarded");
    }
}

impl PoolState {
    /// Every endpoint, starting with the one `selection` picks.
    fn candidates(&mut self, selection: Selection) -> Vec<Endpoint> {
        let len = self.endpoints.len();
        if len == 0 {
            return vec![];
        }

        let start = match selection {
            Selection::RoundRobin => {
                let start = self.next % len;
                self.next = self.next.wrapping_add(1);
                start
            }
            Selection::Random => rand::thread_rng().gen_range(0..len),
            Selection::PrimaryPreferred => 0,
        };

        let mut candidates = self.endpoints.clone();
        candidates.rotate_left(start);
        candidates
    }
}

/// A connection lent out by a [`ConnectionPool`].
///
/// Dereferences to [`Connection`]. Dropping the guard returns the connection
/// to the pool if it is still `Ready`, otherwise the connection is closed and
/// its slot freed.
pub struct PooledConnection {
    conn: Option<Connection>,

    pool: Arc<PoolInner>,

    generation: u64,

    // 在 drop() 之后才释放，等待者能拿到刚归还的连接
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Drop the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn, "discarded by borrower");
        }
    }

    /// Generation of the pool's endpoint list this connection was borrowed
    /// under.
    pub fn pool_generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            // conn 只会在 discard/drop 中被取走，二者都消耗了 self
            None => unreachable!("pooled connection already released"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection already released"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.generation);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish()
    }
}
