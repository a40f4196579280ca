//! Bounded pool of browser sessions.
//!
//! Sessions are expensive (a Chromium process each), so the pool caps how many
//! exist at once and recycles them between workers:
//!
//! - a counting [`Semaphore`] with `capacity` permits is acquired before a
//!   session is reused or created, and released when it comes back;
//! - idle sessions sit on a LIFO stack, so the most recently used (and most
//!   likely still warm) session is handed out first;
//! - a new session is only created when the stack is empty, which keeps
//!   `live <= capacity` at all times;
//! - a session that fails its health check on release is closed instead of
//!   recycled, and the next [`SessionPool::acquire`] replaces it lazily.
//!
//! The idle stack has its own lock, separate from the ledger, and it is never
//! held across an await.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::error::PoolError;
use crate::fetcher::{PageSession, Session, SessionFactory};

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<Vec<Session>>,
    gate: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Session>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget_one(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared handle to the pool; cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "Created session pool");
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                gate: Arc::new(Semaphore::new(capacity)),
                capacity,
                acquire_timeout,
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Sessions currently in existence, lent or idle.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Borrow a session, waiting for capacity if every permit is taken.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AcquireTimeout`] if no permit frees up in time
    /// - [`PoolError::Closed`] after [`SessionPool::drain`]
    /// - [`PoolError::Create`] if a fresh session fails to start
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) -> Result<PooledSession, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.gate).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::AcquireTimeout(self.inner.acquire_timeout))?
        .map_err(|_| PoolError::Closed)?;

        let reused = self.inner.idle().pop();
        let session = match reused {
            Some(session) => {
                debug!("Reusing idle session");
                session
            }
            None => {
                let session = self.inner.factory.create().await.map_err(PoolError::Create)?;
                let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(live, capacity = self.inner.capacity, "Created session");
                session
            }
        };

        Ok(PooledSession {
            session: Some(session),
            _permit: permit,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a session for reuse, or close it if it no longer responds.
    pub async fn release(&self, mut handle: PooledSession) {
        let Some(session) = handle.session.take() else {
            return;
        };
        if self.is_closed() || !session.is_alive().await {
            debug!(closed = self.is_closed(), "Closing returned session instead of recycling");
            session.close().await;
            self.inner.forget_one();
            return;
        }
        self.inner.idle().push(session);
    }

    /// Close a session the caller already knows is broken.
    pub async fn discard(&self, mut handle: PooledSession) {
        if let Some(session) = handle.session.take() {
            warn!("Discarding broken session");
            session.close().await;
            self.inner.forget_one();
        }
    }

    /// Close every idle session and refuse further acquires.
    ///
    /// Sessions still on loan are closed as they are released.
    #[instrument(level = "info", skip(self))]
    pub async fn drain(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.gate.close();
        let idle: Vec<Session> = std::mem::take(&mut *self.inner.idle());
        let count = idle.len();
        for session in idle {
            session.close().await;
            self.inner.forget_one();
        }
        info!(closed = count, still_lent = self.live(), "Drained session pool");
    }
}

/// A session on loan from the pool.
///
/// Hand it back with [`SessionPool::release`] or [`SessionPool::discard`].
/// Dropping it instead releases the permit and treats the session as lost.
pub struct PooledSession {
    session: Option<Session>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSession {
    type Target = dyn PageSession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session is only taken by release/discard, which consume the handle"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            warn!("Pooled session dropped without release; discarding it");
            self.pool.forget_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::{FakeFactory, FakeWeb};

    fn pool_with(web: FakeWeb, capacity: usize) -> (SessionPool, Arc<FakeWeb>) {
        let (factory, web) = FakeFactory::new(web);
        (SessionPool::new(factory, capacity, Duration::from_secs(5)), web)
    }

    #[tokio::test]
    async fn test_released_session_is_reused() {
        let (pool, web) = pool_with(FakeWeb::new(), 2);
        let first = pool.acquire().await.unwrap();
        pool.release(first).await;
        assert_eq!(pool.idle(), 1);

        let second = pool.acquire().await.unwrap();
        assert_eq!(web.created(), 1);
        pool.release(second).await;
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn test_idle_stack_is_lifo() {
        let web = FakeWeb::new().page("https://b.example", r#"<p id="marker">b</p>"#);
        let (pool, web) = pool_with(web, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        b.navigate("https://b.example").await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        // the last session released (b) comes back first, still on its page
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.find_all("#marker").await.unwrap().len(), 1);
        assert_eq!(web.created(), 2);
        pool.release(again).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_sessions_never_exceed_capacity() {
        let (pool, web) = pool_with(FakeWeb::new().latency(Duration::from_millis(100)), 3);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..12 {
            let pool = pool.clone();
            tasks.spawn(async move {
                let session = pool.acquire().await.unwrap();
                session.navigate(&format!("https://example.com/{i}")).await.unwrap();
                pool.release(session).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert!(web.peak() <= 3, "peak was {}", web.peak());
        assert_eq!(web.navigation_count(), 12);
        assert!(pool.live() <= 3);
    }

    #[tokio::test]
    async fn test_dead_session_is_not_recycled() {
        let (pool, web) = pool_with(FakeWeb::new().deadly("https://crash.example"), 1);
        let session = pool.acquire().await.unwrap();
        assert!(session.navigate("https://crash.example").await.is_err());
        pool.release(session).await;
        assert_eq!(pool.live(), 0);
        assert_eq!(web.live(), 0);

        let fresh = pool.acquire().await.unwrap();
        assert!(fresh.is_alive().await);
        assert_eq!(web.created(), 2);
        pool.release(fresh).await;
    }

    #[tokio::test]
    async fn test_discard_frees_capacity() {
        let (pool, web) = pool_with(FakeWeb::new(), 1);
        let session = pool.acquire().await.unwrap();
        pool.discard(session).await;
        assert_eq!(pool.live(), 0);
        assert_eq!(web.live(), 0);
        let again = pool.acquire().await.unwrap();
        pool.release(again).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let (factory, _web) = FakeFactory::new(FakeWeb::new());
        let pool = SessionPool::new(factory, 1, Duration::from_secs(2));
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_drain_closes_idle_and_refuses_acquire() {
        let (pool, web) = pool_with(FakeWeb::new(), 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;

        pool.drain().await;
        assert_eq!(web.live(), 1);
        assert!(matches!(pool.acquire().await.err().unwrap(), PoolError::Closed));

        pool.release(b).await;
        assert_eq!(web.live(), 0);
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_returns_permit() {
        let (pool, _web) = pool_with(FakeWeb::new(), 1);
        let session = pool.acquire().await.unwrap();
        drop(session);
        assert_eq!(pool.live(), 0);
        let again = pool.acquire().await.unwrap();
        pool.release(again).await;
    }
}
