//! Generic bounded object pool.
//!
//! Borrowing is bounded by a semaphore holding `max_size` permits, so at
//! most `max_size` objects are ever out at once. Idle objects sit in a
//! LIFO list and are handed out again before anything new is created.
//!
//! Every pooled object is destroyed at most once. Eviction, invalidation,
//! pool close and release-into-a-full-pool all go through the same atomic
//! destroy flag on [`Pooled`], so concurrent paths cannot double-destroy.
//!
//! # Example
//!
//! ```rust,no_run
//! # use kafka_indexer::pool::{ObjectPool, PooledObjectFactory};
//! # async fn example<F: PooledObjectFactory>(factory: F) -> kafka_indexer::Result<()> {
//! let pool = ObjectPool::new(factory, Default::default());
//! let _evictor = pool.spawn_evictor();
//!
//! {
//!     let object = pool.borrow().await?;
//!     // use `*object`; dropping the guard returns it to the pool
//! }
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::PoolConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle hooks the pool calls on the objects it manages.
#[async_trait]
pub trait PooledObjectFactory: Send + Sync + 'static {
    type Object: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Object>;

    /// Called before an idle object is handed out again. Returning `false`
    /// destroys it and moves on to the next candidate.
    async fn validate_object(&self, _object: &Self::Object) -> bool {
        true
    }

    /// Releases the object's resources. The pool calls this at most once per
    /// pooled instance.
    async fn destroy_object(&self, pooled: &Pooled<Self::Object>) -> Result<()>;
}

/// An object plus the bookkeeping the pool keeps for it.
#[derive(Debug)]
pub struct Pooled<T> {
    id: u64,
    object: T,
    created_at: Instant,
    destroyed: AtomicBool,
}

impl<T> Pooled<T> {
    fn new(id: u64, object: T) -> Self {
        Self {
            id,
            object,
            created_at: Instant::now(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn object(&self) -> &T {
        &self.object
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Returns `true` only for the first caller.
    fn begin_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}

struct IdleEntry<T> {
    pooled: Arc<Pooled<T>>,
    idle_since: Instant,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct Shared<F: PooledObjectFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleEntry<F::Object>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<F: PooledObjectFactory> Shared<F> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleEntry<F::Object>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &IdleEntry<F::Object>) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|timeout| entry.idle_since.elapsed() >= timeout)
    }

    async fn destroy(&self, pooled: Arc<Pooled<F::Object>>) {
        if !pooled.begin_destroy() {
            return;
        }

        if let Err(e) = self.factory.destroy_object(&pooled).await {
            warn!(pooled_id = pooled.id(), error = %e, "Failed to destroy pooled object");
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(pooled_id = pooled.id(), "Destroyed pooled object");
    }

    /// Destroy from a synchronous context (a guard's `Drop`).
    fn destroy_detached(self: &Arc<Self>, pooled: Arc<Pooled<F::Object>>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move { shared.destroy(pooled).await });
            }
            Err(_) => warn!(
                pooled_id = pooled.id(),
                "No async runtime available, pooled object dropped without destroy"
            ),
        }
    }

    fn release(self: &Arc<Self>, pooled: Arc<Pooled<F::Object>>) {
        if pooled.is_destroyed() {
            return;
        }

        // Checked under the idle lock so a return cannot land after `close` drains.
        let mut idle = self.idle();
        if self.closed.load(Ordering::Acquire) || idle.len() >= self.config.max_idle {
            drop(idle);
            self.destroy_detached(pooled);
            return;
        }

        idle.push_back(IdleEntry {
            pooled,
            idle_since: Instant::now(),
        });
    }
}

/// Bounded pool of reusable objects. Cloning shares the same pool.
pub struct ObjectPool<F: PooledObjectFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: PooledObjectFactory> Clone for ObjectPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: PooledObjectFactory> ObjectPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Borrows an idle object or creates a new one.
    ///
    /// With `max_wait` unset this waits for a free slot; otherwise it fails
    /// with [`Error::PoolExhausted`] once the wait elapses.
    pub async fn borrow(&self) -> Result<PoolGuard<F>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let permit = self.acquire_permit().await?;

        loop {
            let candidate = self.shared.idle().pop_back();
            let Some(entry) = candidate else { break };

            if self.shared.is_expired(&entry) {
                debug!(pooled_id = entry.pooled.id(), "Idle object expired");
                self.shared.destroy(entry.pooled).await;
                continue;
            }

            if !self.shared.factory.validate_object(entry.pooled.object()).await {
                debug!(pooled_id = entry.pooled.id(), "Idle object failed validation");
                self.shared.destroy(entry.pooled).await;
                continue;
            }

            return Ok(PoolGuard::new(entry.pooled, Arc::clone(&self.shared), permit));
        }

        let object = self.shared.factory.create().await?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        debug!(pooled_id = id, "Created pooled object");

        Ok(PoolGuard::new(
            Arc::new(Pooled::new(id, object)),
            Arc::clone(&self.shared),
            permit,
        ))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.shared.permits).acquire_owned();
        let permit = match self.shared.config.max_wait {
            Some(wait) => tokio::time::timeout(wait, acquire)
                .await
                .map_err(|_| Error::PoolExhausted {
                    waited_ms: wait.as_millis() as u64,
                })?,
            None => acquire.await,
        };
        permit.map_err(|_| Error::PoolClosed)
    }

    /// Destroys idle objects that have sat unused longer than the idle timeout.
    pub async fn evict_idle(&self) -> usize {
        if self.shared.config.idle_timeout.is_none() {
            return 0;
        }

        let expired: Vec<Arc<Pooled<F::Object>>> = {
            let mut idle = self.shared.idle();
            let entries: Vec<_> = idle.drain(..).collect();
            let mut expired = Vec::new();
            for entry in entries {
                if self.shared.is_expired(&entry) {
                    expired.push(entry.pooled);
                } else {
                    idle.push_back(entry);
                }
            }
            expired
        };

        let count = expired.len();
        for pooled in expired {
            self.shared.destroy(pooled).await;
        }
        if count > 0 {
            debug!(evicted = count, "Evicted idle objects");
        }
        count
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `eviction_interval` until
    /// the pool is closed.
    pub fn spawn_evictor(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.shared.config.eviction_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.evict_idle().await;
            }
        })
    }

    /// Stops handing out objects and destroys everything idle. Borrowed
    /// objects are destroyed as their guards drop.
    pub async fn close(&self) {
        let idle: Vec<_> = {
            let mut idle = self.shared.idle();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        self.shared.permits.close();

        let count = idle.len();
        join_all(idle.into_iter().map(|entry| self.shared.destroy(entry.pooled))).await;

        info!(destroyed_idle = count, "Pool closed");
    }

    pub fn status(&self) -> PoolStatus {
        let max_size = self.shared.config.max_size;
        PoolStatus {
            max_size,
            idle: self.shared.idle().len(),
            borrowed: max_size.saturating_sub(self.shared.permits.available_permits()),
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
        }
    }
}

/// A borrowed object. Dropping the guard returns the object to the pool.
pub struct PoolGuard<F: PooledObjectFactory> {
    pooled: Option<Arc<Pooled<F::Object>>>,
    shared: Arc<Shared<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: PooledObjectFactory> PoolGuard<F> {
    fn new(
        pooled: Arc<Pooled<F::Object>>,
        shared: Arc<Shared<F>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pooled: Some(pooled),
            shared,
            _permit: permit,
        }
    }

    pub fn pooled_id(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.id()).unwrap_or_default()
    }

    /// Destroys the object instead of returning it, e.g. after a transport
    /// failure left it in an unknown state.
    pub async fn invalidate(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.destroy(pooled).await;
        }
    }
}

impl<F: PooledObjectFactory> Deref for PoolGuard<F> {
    type Target = F::Object;

    fn deref(&self) -> &F::Object {
        match &self.pooled {
            Some(pooled) => pooled.object(),
            // `pooled` is only taken by `invalidate` (which consumes the
            // guard) and by `drop`.
            None => unreachable!("pool guard used after release"),
        }
    }
}

impl<F: PooledObjectFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.release(pooled);
        }
    }
}
