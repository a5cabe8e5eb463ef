// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Pool
//!
//! A bounded pool of broker channels. Items are created lazily, up to the
//! pool capacity, and each item has at most one borrower at a time.
//! Borrowing waits until an item is idle or capacity allows creating one;
//! there is no timeout, callers wanting one wrap the borrow themselves.
//!
//! Items are checked when they come back: invalid ones (a closed channel,
//! typically) are discarded and a replacement is created on demand.

use crate::{
    channel::{AmqpChannel, AmqpConnection},
    config::PoolConfig,
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Creates, checks and disposes of pooled items.
#[async_trait]
pub trait PoolManager: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Item, AmqpError>;

    fn is_valid(&self, item: &Self::Item) -> bool;

    async fn close(&self, item: Self::Item);
}

/// Pools channels of one broker connection.
pub struct ChannelManager {
    connection: Arc<dyn AmqpConnection>,
}

impl ChannelManager {
    pub fn new(connection: Arc<dyn AmqpConnection>) -> Self {
        ChannelManager { connection }
    }
}

#[async_trait]
impl PoolManager for ChannelManager {
    type Item = Arc<dyn AmqpChannel>;

    async fn create(&self) -> Result<Self::Item, AmqpError> {
        self.connection.create_channel().await
    }

    fn is_valid(&self, item: &Self::Item) -> bool {
        item.is_open()
    }

    async fn close(&self, item: Self::Item) {
        if let Err(err) = item.close().await {
            error!(error = err.to_string(), "failure to close pooled channel");
        }
    }
}

pub type ChannelPool = Pool<ChannelManager>;

impl ChannelPool {
    /// A channel pool over `connection`, never larger than the channel count
    /// the broker negotiated.
    pub fn for_connection(connection: Arc<dyn AmqpConnection>, capacity: usize) -> Self {
        let capacity = match connection.channel_max() {
            0 => capacity,
            max => capacity.min(max as usize),
        };
        Pool::new(ChannelManager::new(connection), capacity)
    }

    /// A channel pool over `connection` sized by `cfg`.
    pub fn from_config(connection: Arc<dyn AmqpConnection>, cfg: &PoolConfig) -> Self {
        ChannelPool::for_connection(connection, cfg.capacity)
    }
}

struct PoolInner<M: PoolManager> {
    manager: M,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<M::Item>>,
    closed: AtomicBool,
}

impl<M: PoolManager> PoolInner<M> {
    fn take_idle(&self) -> Option<M::Item> {
        match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(_) => None,
        }
    }

    fn release(self: &Arc<Self>, item: M::Item) {
        if self.closed.load(Ordering::Acquire) {
            self.dispose(item);
            return;
        }

        if !self.manager.is_valid(&item) {
            warn!("discarding invalid pool item");
            return;
        }

        match self.idle.lock() {
            Ok(mut idle) => idle.push(item),
            Err(_) => error!("pool lock poisoned, dropping item"),
        }
    }

    fn dispose(self: &Arc<Self>, item: M::Item) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.clone();
            runtime.spawn(async move { inner.manager.close(item).await });
        }
    }
}

/// Bounded pool of items created by a [`PoolManager`].
pub struct Pool<M: PoolManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: PoolManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: PoolManager> Pool<M> {
    /// Creates an empty pool. No item is created until the first borrow.
    ///
    /// # Parameters
    /// * `manager` - Creates, validates and closes the pooled items
    /// * `capacity` - Maximum number of items in existence at once, at least 1
    pub fn new(manager: M, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Pool {
            inner: Arc::new(PoolInner {
                manager,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(vec![]),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Maximum number of items lent out at the same time.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of items waiting in the pool to be borrowed.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or_default()
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrows an item, waiting for one to become available.
    ///
    /// # Returns
    /// The borrowed item, or `AmqpError::PoolClosed` once the pool is
    /// closed, including when it closes while the item is being created.
    pub async fn get(&self) -> Result<Pooled<M>, AmqpError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::PoolClosed)?;
        if self.is_closed() {
            return Err(AmqpError::PoolClosed);
        }

        while let Some(item) = self.inner.take_idle() {
            if self.inner.manager.is_valid(&item) {
                return Ok(self.lend(item, permit));
            }
            debug!("dropping idle pool item that is no longer valid");
        }

        debug!("creating pool item");
        let item = self.inner.manager.create().await?;
        if self.is_closed() {
            debug!("pool closed while creating an item, closing it");
            self.inner.manager.close(item).await;
            return Err(AmqpError::PoolClosed);
        }
        Ok(self.lend(item, permit))
    }

    fn lend(&self, item: M::Item, permit: OwnedSemaphorePermit) -> Pooled<M> {
        Pooled {
            item: Some(item),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Runs `f` with a borrowed item. The item goes back to the pool (or is
    /// discarded) on every exit path.
    pub async fn with_item<F, R>(&self, f: F) -> Result<R, AmqpError>
    where
        F: for<'a> FnOnce(&'a M::Item) -> BoxFuture<'a, Result<R, AmqpError>>,
    {
        let item = self.get().await?;
        f(&item).await
    }

    /// Runs `f` with a borrowed item on a background task. Failures are
    /// logged.
    pub fn run<F>(&self, f: F) -> JoinHandle<()>
    where
        F: for<'a> FnOnce(&'a M::Item) -> BoxFuture<'a, Result<(), AmqpError>> + Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.with_item(f).await {
                error!(error = err.to_string(), "pooled task failed");
            }
        })
    }

    /// Closes every idle item and refuses further borrows. Items still
    /// borrowed are closed when they come back. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let idle = match self.inner.idle.lock() {
            Ok(mut idle) => std::mem::take(&mut *idle),
            Err(_) => vec![],
        };

        debug!(count = idle.len(), "closing idle pool items");
        for item in idle {
            self.inner.manager.close(item).await;
        }
    }
}

/// A borrowed item. Dropping it hands the item back to the pool.
pub struct Pooled<M: PoolManager> {
    item: Option<M::Item>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: PoolManager> Deref for Pooled<M> {
    type Target = M::Item;

    fn deref(&self) -> &Self::Target {
        // only `drop` takes the item out
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<M: PoolManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
