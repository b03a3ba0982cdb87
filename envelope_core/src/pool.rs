//! Bounded client-side connection pool.
//!
//! At most `size` connections are checked out at once; a caller that finds no
//! free permit waits. With `single_use` every connection is closed after its
//! exchange, otherwise a connection whose exchange succeeded is parked for
//! the next caller. A checked-out connection is never shared.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::NetworkError;
use crate::transport::FramedConnection;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// `host:port` of the responder.
    pub address: String,
    pub size: usize,
    pub single_use: bool,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

struct PoolInner {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<FramedConnection>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        // a zero-sized pool would block forever
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                config: PoolConfig { size, ..config },
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Wait for a slot, then hand out a parked connection or open a new one.
    pub async fn acquire(&self) -> Result<PooledConnection, NetworkError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| NetworkError::PoolClosed)?;

        while let Some(conn) = self.pop_idle() {
            if conn.is_stale() {
                trace!(peer = %conn.peer_addr(), "discarding stale pooled connection");
                continue;
            }
            trace!(peer = %conn.peer_addr(), "reusing pooled connection");
            return Ok(PooledConnection::new(conn, self.inner.clone(), permit));
        }

        let cfg = &self.inner.config;
        let conn = FramedConnection::connect(cfg.address.as_str(), cfg.connect_timeout, cfg.max_frame_len).await?;
        debug!(peer = %conn.peer_addr(), "opened connection");
        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    /// Wake every waiter with `PoolClosed` and drop parked connections.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().clear();
    }

    fn pop_idle(&self) -> Option<FramedConnection> {
        self.inner.idle.lock().pop()
    }
}

/// A checked-out connection. Dropping it closes the socket and frees the
/// slot; [`PooledConnection::release`] parks it instead (unless single-use).
pub struct PooledConnection {
    conn: Option<FramedConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(conn: FramedConnection, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self { conn: Some(conn), pool, _permit: permit }
    }

    /// Only call after a complete response: the stream must carry nothing
    /// left over from this exchange.
    pub fn release(mut self) {
        if self.pool.config.single_use || self.pool.permits.is_closed() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = FramedConnection;

    fn deref(&self) -> &FramedConnection {
        // only `release` takes the connection, and it consumes `self`
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut FramedConnection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_FRAME_LEN;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn config(address: String, size: usize, single_use: bool) -> PoolConfig {
        PoolConfig {
            address,
            size,
            single_use,
            connect_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Accepts forever and counts accepted sockets; keeps them open.
    async fn counting_listener() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(sock);
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn n_plus_one_acquire_waits_for_a_slot() {
        let (addr, accepted) = counting_listener().await;
        let pool = ConnectionPool::new(config(addr, 2, true));

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let third = tokio::time::timeout(Duration::from_millis(150), pool.acquire()).await;
        assert!(third.is_err(), "third acquire must block while two are out");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        drop(a);
        let _c = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .expect("slot freed")
            .unwrap();
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn released_connection_is_reused_unless_single_use() {
        let (addr, accepted) = counting_listener().await;

        let reuse = ConnectionPool::new(config(addr.clone(), 1, false));
        reuse.acquire().await.unwrap().release();
        assert_eq!(reuse.idle_count(), 1);
        reuse.acquire().await.unwrap().release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let single = ConnectionPool::new(config(addr, 1, true));
        single.acquire().await.unwrap().release();
        assert_eq!(single.idle_count(), 0);
        assert_eq!(single.available(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_is_not_parked() {
        let (addr, _) = counting_listener().await;
        let pool = ConnectionPool::new(config(addr, 1, false));

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let (addr, _) = counting_listener().await;
        let pool = ConnectionPool::new(config(addr, 1, false));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.err() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close();

        assert!(matches!(waiter.await.unwrap(), Some(NetworkError::PoolClosed)));
        held.release();
        assert_eq!(pool.idle_count(), 0);
    }
}
