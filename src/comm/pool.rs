//! Bounded, address-keyed pool of reusable peer connections.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::address::Address;
use crate::comm::connection::Connection;
use crate::error::{Result, WorkerError};

/// Default cap on idle connections across all peers.
pub const DEFAULT_POOL_LIMIT: usize = 128;

/// Default cap on idle connections per peer.
pub const DEFAULT_PER_ADDRESS_LIMIT: usize = 8;

/// An address-keyed cache of idle connections.
///
/// `acquire` hands out an idle connection or dials a new one; `release`
/// returns connections to the idle set unless they are broken or the pool is
/// over capacity, in which case they are closed by dropping.
#[derive(Debug)]
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    limit: usize,
    per_address: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: HashMap<Address, Vec<Connection>>,
    total_idle: usize,
    closed: bool,
}

impl ConnectionPool {
    /// Create a pool with the given total and per-address idle caps.
    pub fn new(limit: usize, per_address: usize) -> Self {
        assert!(limit >= 1, "pool limit must be at least 1");
        assert!(per_address >= 1, "per-address limit must be at least 1");
        Self { inner: Mutex::new(PoolInner::default()), limit, per_address }
    }

    /// Get a connection to `addr`, reusing an idle one when available.
    pub async fn acquire(&self, addr: &Address) -> Result<Connection> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(WorkerError::PoolClosed);
            }
            if let Some(idle) = inner.idle.get_mut(addr) {
                if let Some(conn) = idle.pop() {
                    inner.total_idle -= 1;
                    debug!(addr = %addr, "reusing pooled connection");
                    return Ok(conn);
                }
            }
        }
        Connection::connect(addr).await
    }

    /// Return a connection to the pool.
    ///
    /// Broken connections and connections beyond the caps are closed instead.
    pub async fn release(&self, conn: Connection) {
        if conn.is_broken() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.total_idle >= self.limit {
            return;
        }
        let idle = inner.idle.entry(conn.peer().clone()).or_default();
        if idle.len() >= self.per_address {
            return;
        }
        idle.push(conn);
        inner.total_idle += 1;
    }

    /// Close the pool: drop all idle connections and reject further acquires.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.idle.clear();
        inner.total_idle = 0;
    }

    /// Number of idle connections currently cached.
    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.total_idle
    }
}
