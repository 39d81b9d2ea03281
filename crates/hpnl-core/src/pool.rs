use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use hpnl_net::{BufferRole, MemoryRegion, Transport};
use hpnl_types::BufferId;
use parking_lot::Mutex;

use crate::buffer::MemoryBuffer;
use crate::error::{HpnlError, Result};

#[derive(Default)]
struct PoolState {
    buffers: HashMap<BufferId, Arc<MemoryBuffer>>,
    free: VecDeque<BufferId>,
    checked_out: HashSet<BufferId>,
    next_id: u32,
}

/// Registered buffers of one role.
///
/// Buffers are handed out by [`checkout`](Self::checkout) and come back through
/// [`release`](Self::release). The pool grows in steps of `next_batch_size`
/// and never shrinks on its own; ids are never reused.
pub struct BufferPool {
    role: BufferRole,
    buffer_size: usize,
    next_batch_size: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool and register `initial` buffers of `buffer_size` bytes.
    pub fn new(
        role: BufferRole,
        buffer_size: usize,
        initial: usize,
        next_batch_size: usize,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let pool = Self {
            role,
            buffer_size,
            next_batch_size,
            transport,
            state: Mutex::new(PoolState::default()),
        };
        pool.allocate(initial)?;
        Ok(pool)
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn next_batch_size(&self) -> usize {
        self.next_batch_size
    }

    /// Total number of buffers owned by the pool.
    pub fn len(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers ready for checkout.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn checked_out(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    pub fn is_checked_out(&self, id: BufferId) -> bool {
        self.state.lock().checked_out.contains(&id)
    }

    /// Look up a buffer by id regardless of its checkout state.
    pub fn acquire(&self, id: BufferId) -> Result<Arc<MemoryBuffer>> {
        self.state
            .lock()
            .buffers
            .get(&id)
            .cloned()
            .ok_or(HpnlError::InvalidBufferId { role: self.role, id })
    }

    /// Take the oldest free buffer.
    pub fn checkout(&self) -> Result<Arc<MemoryBuffer>> {
        let mut state = self.state.lock();
        let id = state
            .free
            .pop_front()
            .ok_or(HpnlError::BufferPoolExhausted(self.role))?;
        state.checked_out.insert(id);
        state
            .buffers
            .get(&id)
            .cloned()
            .ok_or(HpnlError::InvalidBufferId { role: self.role, id })
    }

    /// [`checkout`](Self::checkout), growing the pool once if it is exhausted.
    pub fn checkout_or_grow(&self) -> Result<Arc<MemoryBuffer>> {
        match self.checkout() {
            Err(HpnlError::BufferPoolExhausted(_)) => {
                self.grow()?;
                self.checkout()
            }
            other => other,
        }
    }

    /// Return a checked-out buffer to the free list.
    pub fn release(&self, id: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(buffer) = state.buffers.get(&id).cloned() else {
            return Err(HpnlError::InvalidBufferId { role: self.role, id });
        };
        if !state.checked_out.remove(&id) {
            return Err(HpnlError::DoubleRelease { role: self.role, id });
        }
        buffer.clear();
        state.free.push_back(id);
        Ok(())
    }

    /// Add `next_batch_size` registered buffers. Returns the new total.
    pub fn grow(&self) -> Result<usize> {
        self.allocate(self.next_batch_size)?;
        let total = self.len();
        tracing::debug!(role = %self.role, added = self.next_batch_size, total, "buffer pool grown");
        Ok(total)
    }

    /// Register a caller-provided region under a fresh id. The buffer is owned
    /// by the pool but never handed out by `checkout`.
    pub fn adopt(&self, region: MemoryRegion) -> Result<Arc<MemoryBuffer>> {
        let id = self.reserve_ids(1);
        let buffer = Arc::new(self.register(id, Arc::new(region))?);
        self.state.lock().buffers.insert(id, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Deregister and drop a buffer.
    pub fn remove(&self, id: BufferId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.buffers.remove(&id).is_none() {
                return Err(HpnlError::InvalidBufferId { role: self.role, id });
            }
            state.free.retain(|free| *free != id);
            state.checked_out.remove(&id);
        }
        self.transport.deregister_buffer(self.role, id)?;
        Ok(())
    }

    fn reserve_ids(&self, n: usize) -> BufferId {
        let mut state = self.state.lock();
        let first = state.next_id;
        state.next_id = first.saturating_add(n as u32);
        BufferId(first)
    }

    fn register(&self, id: BufferId, region: Arc<MemoryRegion>) -> Result<MemoryBuffer> {
        let rkey = self
            .transport
            .register_buffer(self.role, id, Arc::clone(&region))
            .map_err(|source| HpnlError::RegistrationFailure {
                role: self.role,
                id,
                source,
            })?;
        Ok(MemoryBuffer::new(id, self.role, region, rkey))
    }

    /// Register `n` new buffers; all or nothing.
    fn allocate(&self, n: usize) -> Result<()> {
        let first = self.reserve_ids(n);
        let mut registered = Vec::with_capacity(n);
        for offset in 0..n {
            let id = BufferId(first.raw() + offset as u32);
            let region = Arc::new(MemoryRegion::zeroed(self.buffer_size));
            match self.register(id, region) {
                Ok(buffer) => registered.push(Arc::new(buffer)),
                Err(err) => {
                    for buffer in &registered {
                        if let Err(e) = self.transport.deregister_buffer(self.role, buffer.id()) {
                            tracing::warn!(role = %self.role, id = %buffer.id(), error = %e, "rollback deregistration failed");
                        }
                    }
                    tracing::warn!(role = %self.role, requested = n, error = %err, "buffer allocation failed");
                    return Err(err);
                }
            }
        }

        let mut state = self.state.lock();
        for buffer in registered {
            state.free.push_back(buffer.id());
            state.buffers.insert(buffer.id(), buffer);
        }
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let ids: Vec<BufferId> = self.state.get_mut().buffers.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.transport.deregister_buffer(self.role, id) {
                tracing::debug!(role = %self.role, %id, error = %err, "deregistration on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpnl_net_loopback::LoopbackFabric;

    fn pool(fabric: &LoopbackFabric, initial: usize, batch: usize) -> BufferPool {
        BufferPool::new(BufferRole::Send, 64, initial, batch, fabric.transport()).unwrap()
    }

    #[test]
    fn test_new_registers_initial_buffers() {
        let fabric = LoopbackFabric::new();
        let pool = pool(&fabric, 4, 2);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(fabric.registered_buffers(), 4);
        drop(pool);
        assert_eq!(fabric.registered_buffers(), 0);
    }

    #[test]
    fn test_checkout_release_cycle() {
        let fabric = LoopbackFabric::new();
        let pool = pool(&fabric, 2, 2);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(pool.is_checked_out(a.id()));
        assert!(matches!(
            pool.checkout(),
            Err(HpnlError::BufferPoolExhausted(BufferRole::Send))
        ));

        pool.release(a.id()).unwrap();
        assert!(matches!(
            pool.release(a.id()),
            Err(HpnlError::DoubleRelease { .. })
        ));
        assert!(matches!(
            pool.release(BufferId(99)),
            Err(HpnlError::InvalidBufferId { .. })
        ));
        assert_eq!(pool.checkout().unwrap().id(), a.id());
    }

    #[test]
    fn test_release_clears_frame() {
        let fabric = LoopbackFabric::new();
        let pool = pool(&fabric, 1, 1);
        let buf = pool.checkout().unwrap();
        buf.put_data(1, 1, b"abc").unwrap();
        pool.release(buf.id()).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_grow_after_exhaustion() {
        let fabric = LoopbackFabric::new();
        let pool = pool(&fabric, 2, 3);
        let first = pool.checkout().unwrap();
        let second = pool.checkout().unwrap();
        assert_eq!(pool.available(), 0);

        assert_eq!(pool.grow().unwrap(), 5);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.acquire(first.id()).unwrap().id(), first.id());
        assert_eq!(pool.acquire(second.id()).unwrap().id(), second.id());
        let next = pool.checkout().unwrap();
        assert!(next.id() > second.id());
    }

    #[test]
    fn test_checkout_or_grow() {
        let fabric = LoopbackFabric::new();
        let pool = pool(&fabric, 1, 2);
        pool.checkout().unwrap();
        pool.checkout_or_grow().unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_failed_grow_rolls_back() {
        let fabric = LoopbackFabric::with_registration_limit(3);
        let pool = pool(&fabric, 2, 2);
        let err = pool.grow().unwrap_err();
        assert!(matches!(err, HpnlError::RegistrationFailure { .. }));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(fabric.registered_buffers(), 2);
    }

    #[test]
    fn test_adopt_and_remove() {
        let fabric = LoopbackFabric::new();
        let pool = BufferPool::new(BufferRole::Rma, 0, 0, 1, fabric.transport()).unwrap();
        let buf = pool.adopt(MemoryRegion::from_vec(vec![5; 100])).unwrap();
        assert_eq!(buf.capacity(), 100);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.acquire(buf.id()).unwrap().capacity(), 100);
        pool.remove(buf.id()).unwrap();
        assert!(pool.acquire(buf.id()).is_err());
        assert_eq!(fabric.registered_buffers(), 0);
    }
}
