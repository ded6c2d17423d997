//! FIFO-fair bounded slot pool

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Concurrency pool '{0}' is closed")]
    Closed(&'static str),

    #[error("Concurrency pool '{name}' holds {capacity} slots, {requested} requested at once")]
    OverCapacity {
        name: &'static str,
        requested: usize,
        capacity: usize,
    },
}

#[derive(Debug)]
struct PoolInner {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Bounded pool of slots. Waiters are served in arrival order.
#[derive(Debug, Clone)]
pub struct ConcurrencyPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
}

impl PoolStats {
    pub fn in_use(&self) -> u64 {
        self.acquired - self.released
    }
}

impl ConcurrencyPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> Result<PoolSlot, PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.inner.name))?;
        Ok(self.slot(permit))
    }

    /// Wait until `count` slots are free and take them together.
    ///
    /// Nothing is held while waiting, so callers that need several slots
    /// cannot starve each other. Asking for more than the pool holds is an
    /// error rather than a wait that never ends.
    pub async fn acquire_many(&self, count: usize) -> Result<Vec<PoolSlot>, PoolError> {
        let over = || PoolError::OverCapacity {
            name: self.inner.name,
            requested: count,
            capacity: self.inner.capacity,
        };
        if count > self.inner.capacity {
            return Err(over());
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let permits = u32::try_from(count).map_err(|_| over())?;
        let mut permit = Arc::clone(&self.inner.semaphore)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| PoolError::Closed(self.inner.name))?;

        let mut slots = Vec::with_capacity(count);
        for _ in 1..count {
            if let Some(one) = permit.split(1) {
                slots.push(self.slot(one));
            }
        }
        slots.push(self.slot(permit));
        Ok(slots)
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<PoolSlot> {
        Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.slot(permit))
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> PoolSlot {
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        trace!(pool = self.inner.name, "Slot acquired");
        PoolSlot {
            _permit: permit,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            available: self.inner.semaphore.available_permits(),
            acquired: self.inner.acquired.load(Ordering::SeqCst),
            released: self.inner.released.load(Ordering::SeqCst),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

/// A held slot. Dropping it releases the slot, exactly once.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.released.fetch_add(1, Ordering::SeqCst);
        trace!(pool = self.pool.name, "Slot released");
    }
}
