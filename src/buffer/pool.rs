//! Buffer pools that recycle storage instead of freeing it.
//!
//! A [`Buffer`](crate::Buffer) created with [`Buffer::from_pool`](crate::Buffer::from_pool)
//! keeps a reference to its pool and hands its storage back when the last
//! handle is dropped. Pools are passed explicitly; there is no global pool.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::BufferError;

/// A recycler for buffer storage.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability if needed
/// - `release` runs on whichever thread dropped the last buffer handle; it
///   must not block on I/O
/// - `acquire` must return storage of exactly `size` bytes
pub trait BufferPool: Send + Sync {
    /// Checks out storage of `size` bytes.
    fn acquire(&self, size: usize) -> Result<Vec<u8>, BufferError>;

    /// Takes back storage from a buffer whose last reference was dropped.
    ///
    /// The pool decides whether to keep it for reuse or free it.
    fn release(&self, storage: Vec<u8>);

    /// Returns usage statistics, if the pool tracks them.
    fn stats(&self) -> Option<PoolStats> {
        None
    }
}

/// Usage statistics of a [`FreeListPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Storages allocated fresh because none could be reused.
    pub allocated: u64,
    /// Storages handed out from the free list.
    pub reused: u64,
    /// Storages returned by released buffers.
    pub returned: u64,
    /// Returned storages dropped because the free list was full.
    pub discarded: u64,
    /// Storages currently waiting in the free list.
    pub free: usize,
}

/// A pool keeping released storage in a free list for reuse.
///
/// Reuse picks the first free storage with enough capacity. The free list
/// is capped by [`PoolConfig::max_free`].
///
/// # Example
///
/// ```
/// use stream_media::{Buffer, BufferPool, FreeListPool};
/// use std::sync::Arc;
///
/// let pool: Arc<dyn BufferPool> = Arc::new(FreeListPool::default());
///
/// let buffer = Buffer::from_pool(&pool, 1024).unwrap();
/// drop(buffer); // storage goes back to the pool
///
/// let again = Buffer::from_pool(&pool, 512).unwrap(); // reuses it
/// assert_eq!(again.size(), 512);
/// assert_eq!(pool.stats().unwrap().reused, 1);
/// ```
pub struct FreeListPool {
    free_list: Mutex<Vec<Vec<u8>>>,
    config: PoolConfig,
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl Default for FreeListPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl FreeListPool {
    /// Creates an empty pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            free_list: Mutex::new(Vec::with_capacity(config.max_free)),
            config,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Drops every storage in the free list and returns the bytes reclaimed.
    pub fn shrink(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed = list.iter().map(Vec::capacity).sum();
        list.clear();
        tracing::debug!(reclaimed, "buffer pool shrunk");
        reclaimed
    }

    fn take_free(&self, size: usize) -> Option<Vec<u8>> {
        let mut list = self.free_list.lock();
        let index = list.iter().position(|storage| storage.capacity() >= size)?;
        Some(list.swap_remove(index))
    }
}

impl BufferPool for FreeListPool {
    fn acquire(&self, size: usize) -> Result<Vec<u8>, BufferError> {
        if let Some(mut storage) = self.take_free(size) {
            storage.clear();
            storage.resize(size, 0);
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(storage);
        }

        let capacity = size.max(self.config.min_capacity);
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::AllocationFailed { size: capacity })?;
        storage.resize(size, 0);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(size, capacity, "buffer pool allocated storage");
        Ok(storage)
    }

    fn release(&self, storage: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        let mut list = self.free_list.lock();
        if list.len() < self.config.max_free {
            list.push(storage);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            free: self.free_list.lock().len(),
        })
    }
}
