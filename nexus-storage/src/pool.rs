//! Bounded connection pool.
//!
//! Thin wrapper over a `deadpool` managed pool. At most `max_size` connections
//! are ever checked out; further callers queue for up to the configured wait
//! timeout and then fail with [`StorageError::PoolExhausted`]. A checked-out
//! connection is returned when its guard drops.

use deadpool::managed::{Manager, Object, Pool, PoolError, TimeoutType};
use deadpool::Runtime;
use nexus_core::{StorageError, StorageResult};
use std::fmt;
use std::time::Duration;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Upper bound on checked-out connections.
    pub max_size: usize,
    /// Connections currently open (idle or checked out).
    pub size: usize,
    /// Idle connections ready for checkout.
    pub available: usize,
    /// Callers queued for a connection.
    pub waiting: usize,
}

impl PoolStatus {
    pub fn in_use(&self) -> usize {
        self.size.saturating_sub(self.available)
    }
}

/// Bounded pool of store connections.
pub struct ConnectionPool<M: Manager> {
    inner: Pool<M>,
    wait_timeout: Duration,
}

impl<M> ConnectionPool<M>
where
    M: Manager,
    M::Error: fmt::Display,
{
    /// Build a pool around `manager`.
    pub fn new(
        manager: M,
        max_size: usize,
        wait_timeout: Duration,
        create_timeout: Duration,
    ) -> StorageResult<Self> {
        let inner = Pool::builder(manager)
            .max_size(max_size)
            .wait_timeout(Some(wait_timeout))
            .create_timeout(Some(create_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StorageError::ConnectionFailed {
                reason: format!("Failed to build pool: {}", e),
            })?;
        Ok(Self::from_pool(inner, wait_timeout))
    }

    /// Wrap an already configured pool.
    pub fn from_pool(inner: Pool<M>, wait_timeout: Duration) -> Self {
        Self {
            inner,
            wait_timeout,
        }
    }

    /// Check out a connection, waiting at most the configured timeout.
    pub async fn get(&self) -> StorageResult<Object<M>> {
        self.inner.get().await.map_err(|e| self.map_error(e))
    }

    fn map_error(&self, err: PoolError<M::Error>) -> StorageError {
        match err {
            PoolError::Timeout(TimeoutType::Wait) => {
                tracing::debug!(
                    waited_ms = self.wait_timeout.as_millis() as u64,
                    "connection checkout timed out"
                );
                StorageError::PoolExhausted {
                    waited: self.wait_timeout,
                }
            }
            PoolError::Timeout(TimeoutType::Create) => StorageError::ConnectionFailed {
                reason: "timed out opening connection".to_string(),
            },
            PoolError::Timeout(TimeoutType::Recycle) => StorageError::ConnectionFailed {
                reason: "timed out recycling connection".to_string(),
            },
            PoolError::Closed => StorageError::PoolClosed,
            PoolError::Backend(e) => StorageError::ConnectionFailed {
                reason: e.to_string(),
            },
            other => StorageError::ConnectionFailed {
                reason: other.to_string(),
            },
        }
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Close the pool. Queued and future checkouts fail with `PoolClosed`;
    /// connections already checked out are dropped when returned.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<M: Manager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool::managed::{Metrics, RecycleResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingManager {
        created: Arc<AtomicUsize>,
    }

    impl Manager for CountingManager {
        type Type = usize;
        type Error = StorageError;

        async fn create(&self) -> Result<usize, StorageError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn recycle(&self, _conn: &mut usize, _: &Metrics) -> RecycleResult<StorageError> {
            Ok(())
        }
    }

    fn pool(max: usize, wait_ms: u64) -> (ConnectionPool<CountingManager>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(
            CountingManager {
                created: created.clone(),
            },
            max,
            Duration::from_millis(wait_ms),
            Duration::from_secs(1),
        )
        .unwrap();
        (pool, created)
    }

    #[tokio::test]
    async fn test_checkout_is_bounded() {
        let (pool, created) = pool(2, 30);
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();

        let err = pool.get().await.unwrap_err();
        assert_eq!(
            err,
            StorageError::PoolExhausted {
                waited: Duration::from_millis(30)
            }
        );
        assert!(err.is_retryable());
        assert_eq!(created.load(Ordering::SeqCst), 2);

        drop(a);
        let c = pool.get().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        drop((b, c));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let (pool, _) = pool(1, 500);
        let pool = Arc::new(pool);
        let held = pool.get().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_status_reports_usage() {
        let (pool, _) = pool(3, 10);
        let conn = pool.get().await.unwrap();
        let status = pool.status();
        assert_eq!(status.max_size, 3);
        assert_eq!(status.size, 1);
        assert_eq!(status.in_use(), 1);
        drop(conn);
        assert_eq!(pool.status().in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let (pool, _) = pool(1, 10);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.get().await.unwrap_err(), StorageError::PoolClosed);
    }
}
