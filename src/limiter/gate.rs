use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::admission::AcquireContext;
use crate::error::{AdmissionError, Result};

/// A resizable FIFO semaphore.
///
/// Growing adds permits right away. Shrinking takes idle permits out of circulation and
/// records the rest as debt, paid off as in-flight permits come back.
#[derive(Debug)]
pub struct Slots {
    sem: Arc<Semaphore>,
    capacity: Mutex<usize>,
    debt: AtomicUsize,
    active: AtomicUsize,
}

impl Slots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity: Mutex::new(capacity),
            debt: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        *self.capacity.lock()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn resize(&self, new_capacity: usize) {
        let mut capacity = self.capacity.lock();
        if new_capacity == *capacity {
            return;
        }

        if new_capacity > *capacity {
            let grow = new_capacity - *capacity;
            let paid = self.take_debt(grow);
            if grow > paid {
                self.sem.add_permits(grow - paid);
            }
        } else {
            let shrink = *capacity - new_capacity;
            let idle = self.sem.available_permits().min(shrink);
            let mut taken = 0;
            if idle > 0 {
                if let Ok(permits) = self.sem.try_acquire_many(idle as u32) {
                    permits.forget();
                    taken = idle;
                }
            }
            self.debt.fetch_add(shrink - taken, Ordering::AcqRel);
        }

        debug!(from = *capacity, to = new_capacity, "Slots resized");
        *capacity = new_capacity;
    }

    fn take_debt(&self, max: usize) -> usize {
        match self
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d - d.min(max)))
        {
            Ok(prev) | Err(prev) => prev.min(max),
        }
    }

    /// Waits for a permit. The permit does not show in [`active`](Self::active) until
    /// it is committed.
    async fn acquire(self: &Arc<Self>) -> std::result::Result<SlotPermit, AcquireError> {
        let permit = self.sem.clone().acquire_owned().await?;
        Ok(SlotPermit {
            slots: self.clone(),
            permit: Some(permit),
            counted: false,
        })
    }

    fn give_back(&self, permit: OwnedSemaphorePermit, counted: bool) {
        let in_debt = self
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok();
        if in_debt {
            permit.forget();
        } else {
            drop(permit);
        }

        if !counted {
            return;
        }
        let res = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(res.is_ok(), "active slot counter went negative");
        if res.is_err() {
            warn!("Active slot counter already at zero, clamped");
        }
    }

    fn close(&self) {
        self.sem.close();
    }
}

/// One held slot. Returned to its [`Slots`] on drop.
#[derive(Debug)]
struct SlotPermit {
    slots: Arc<Slots>,
    permit: Option<OwnedSemaphorePermit>,
    counted: bool,
}

impl SlotPermit {
    fn commit(&mut self) {
        if !self.counted {
            self.counted = true;
            self.slots.active.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.slots.give_back(permit, self.counted);
        }
    }
}

/// A global slot plus a pool slot, held together.
#[derive(Debug)]
pub struct GateToken {
    pool: String,
    global: Option<SlotPermit>,
    pool_slot: Option<SlotPermit>,
}

impl GateToken {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn is_held(&self) -> bool {
        self.global.is_some()
    }

    /// Frees both slots, pool first. Returns `false` if they were already freed.
    pub fn release(&mut self) -> bool {
        match (self.pool_slot.take(), self.global.take()) {
            (Some(pool_slot), Some(global)) => {
                drop(pool_slot);
                drop(global);
                true
            }
            _ => {
                warn!(pool = %self.pool, "Gate token released twice, ignoring");
                false
            }
        }
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        drop(self.pool_slot.take());
        drop(self.global.take());
    }
}

/// Bounds in-flight requests globally and per pool.
#[derive(Debug)]
pub struct ConcurrencyGate {
    global: Arc<Slots>,
    pools: DashMap<String, Arc<Slots>>,
    closed: AtomicBool,
}

impl ConcurrencyGate {
    pub fn new(global_capacity: usize) -> Self {
        Self {
            global: Slots::new(global_capacity),
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A pool seen for the first time starts at `capacity`. Known pools keep whatever
    /// the last resize set.
    fn pool_slots(&self, pool: &str, capacity: usize) -> Arc<Slots> {
        if let Some(slots) = self.pools.get(pool) {
            return slots.clone();
        }
        self.pools
            .entry(pool.to_string())
            .or_insert_with(|| Slots::new(capacity))
            .clone()
    }

    /// Waits for a pool slot and then a global slot. Either both are granted or neither:
    /// an interrupted wait drops whatever was already taken. A caller parked on a full
    /// pool holds no global slot, so other pools keep flowing.
    pub async fn acquire(
        &self,
        pool: &str,
        pool_capacity: usize,
        ctx: &AcquireContext,
    ) -> Result<GateToken> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown);
        }

        let pool_slots = self.pool_slots(pool, pool_capacity);
        let both = async {
            let pool_slot = pool_slots.acquire().await?;
            let global = self.global.acquire().await?;
            Ok::<_, AcquireError>((pool_slot, global))
        };

        match ctx.guard(both).await {
            Ok(Ok((mut pool_slot, mut global))) => {
                pool_slot.commit();
                global.commit();
                Ok(GateToken {
                    pool: pool.to_string(),
                    global: Some(global),
                    pool_slot: Some(pool_slot),
                })
            }
            Ok(Err(_closed)) => Err(AdmissionError::ShuttingDown),
            Err(interrupted) => Err(interrupted.into_error(pool)),
        }
    }

    pub fn resize_global(&self, capacity: usize) {
        self.global.resize(capacity);
    }

    /// Applies a new pool capacity, registering the pool if no caller has reached it yet.
    pub fn resize_pool(&self, pool: &str, capacity: usize) {
        self.pool_slots(pool, capacity).resize(capacity);
    }

    /// Wakes every waiter with `ShuttingDown` and refuses new acquisitions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.global.close();
        for slots in self.pools.iter() {
            slots.close();
        }
    }

    pub fn global_active(&self) -> usize {
        self.global.active()
    }

    pub fn pool_active(&self, pool: &str) -> usize {
        self.pools.get(pool).map(|s| s.active()).unwrap_or(0)
    }
}
