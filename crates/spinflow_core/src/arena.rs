//! Pool of re-usable device buffers.
//!
//! Buffers are pooled by element count. Handing a buffer back to the pool
//! while a kernel that uses it is still queued is fine: every later launch
//! goes to the same stream and runs after it.
//!
//! Provenance is tracked with [`BufferToken`]s, indices into the arena's own
//! slot table tagged with the arena id and a generation counter, so a handle
//! from another arena or from before [`BufferArena::release_all`] is rejected
//! instead of silently corrupting the pool.

use crate::device::{Device, DevicePtr};
use crate::error::{Result, SolverError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ceiling on live buffers of one size. Hitting it means a temporary was
/// never recycled.
pub const DEFAULT_MAX_LIVE_BUFFERS: usize = 100;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Slot {
    ptr: DevicePtr,
    len: usize,
    lent: bool,
}

/// Proof that a buffer was lent by a particular arena. Not `Clone`: one token, one release.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferToken {
    arena: u64,
    generation: u64,
    slot: usize,
}

#[derive(Debug)]
pub struct BufferArena {
    id: u64,
    generation: u64,
    slots: Vec<Slot>,
    pool: HashMap<usize, Vec<usize>>,
    live: HashMap<usize, usize>,
    max_live: usize,
    allocations: usize,
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LIVE_BUFFERS)
    }
}

impl BufferArena {
    pub fn new(max_live: usize) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            slots: Vec::new(),
            pool: HashMap::new(),
            live: HashMap::new(),
            max_live,
            allocations: 0,
        }
    }

    /// Lends `ncomp` buffers of `len` elements, re-using pooled ones first and
    /// allocating only the shortfall.
    pub fn acquire<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        ncomp: usize,
        len: usize,
    ) -> Result<(Vec<DevicePtr>, Vec<BufferToken>)> {
        if ncomp == 0 || len == 0 {
            return Err(SolverError::InvalidBufferShape { ncomp, len });
        }
        let live = self.live(len);
        if live + ncomp > self.max_live {
            return Err(SolverError::BufferLeak {
                len,
                live: live + ncomp,
                max: self.max_live,
            });
        }

        let pool = self.pool.entry(len).or_default();
        let from_pool = ncomp.min(pool.len());
        let mut taken = pool.split_off(pool.len() - from_pool);
        taken.reverse();

        for _ in from_pool..ncomp {
            match device.alloc(len) {
                Ok(ptr) => {
                    self.allocations += 1;
                    self.slots.push(Slot {
                        ptr,
                        len,
                        lent: false,
                    });
                    taken.push(self.slots.len() - 1);
                }
                Err(err) => {
                    self.pool.entry(len).or_default().extend(taken);
                    return Err(err);
                }
            }
        }

        let mut ptrs = Vec::with_capacity(ncomp);
        let mut tokens = Vec::with_capacity(ncomp);
        for slot in taken {
            self.slots[slot].lent = true;
            ptrs.push(self.slots[slot].ptr);
            tokens.push(BufferToken {
                arena: self.id,
                generation: self.generation,
                slot,
            });
        }
        *self.live.entry(len).or_insert(0) += ncomp;
        Ok((ptrs, tokens))
    }

    /// Returns lent buffers to the pool. Either every token is accepted or none is.
    pub fn release(&mut self, tokens: Vec<BufferToken>) -> Result<()> {
        for token in &tokens {
            if token.arena != self.id {
                return Err(SolverError::ForeignBuffer);
            }
            if token.generation != self.generation {
                return Err(SolverError::StaleBuffer);
            }
            match self.slots.get(token.slot) {
                None => return Err(SolverError::ForeignBuffer),
                Some(slot) if !slot.lent => return Err(SolverError::StaleBuffer),
                Some(_) => {}
            }
        }

        for token in tokens {
            let slot = &mut self.slots[token.slot];
            slot.lent = false;
            let len = slot.len;
            self.pool.entry(len).or_default().push(token.slot);
            if let Some(live) = self.live.get_mut(&len) {
                *live -= 1;
            }
        }
        Ok(())
    }

    /// Frees every allocation the arena ever made. Called after a grid resize,
    /// when no pooled size is useful any more. Outstanding tokens become stale.
    pub fn release_all<D: Device + ?Sized>(&mut self, device: &mut D) {
        device.sync();
        for slot in self.slots.drain(..) {
            device.free(slot.ptr);
        }
        self.pool.clear();
        self.live.clear();
        self.generation += 1;
    }

    /// Buffers of `len` elements currently lent out.
    pub fn live(&self, len: usize) -> usize {
        self.live.get(&len).copied().unwrap_or(0)
    }

    /// Buffers of `len` elements waiting in the pool.
    pub fn pooled(&self, len: usize) -> usize {
        self.pool.get(&len).map_or(0, Vec::len)
    }

    /// Device allocations made since the arena was created.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn max_live(&self) -> usize {
        self.max_live
    }
}

#[cfg(test)]
mod tests {
    use super::BufferArena;
    use crate::device::HostDevice;
    use crate::error::SolverError;

    #[test]
    fn acquire_release_acquire_reuses_memory() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::new(10);

        let (first, tokens) = arena.acquire(&mut dev, 3, 16).expect("acquire should succeed");
        assert_eq!(arena.allocations(), 3);
        arena.release(tokens).expect("release should succeed");
        assert_eq!(arena.pooled(16), 3);

        let (second, tokens) = arena.acquire(&mut dev, 3, 16).expect("acquire should succeed");
        assert_eq!(arena.allocations(), 3);
        let mut a = first.clone();
        let mut b = second.clone();
        a.sort_by_key(|p| p.0);
        b.sort_by_key(|p| p.0);
        assert_eq!(a, b);
        arena.release(tokens).expect("release should succeed");
    }

    #[test]
    fn only_the_shortfall_is_allocated() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::new(10);
        let (_, tokens) = arena.acquire(&mut dev, 1, 8).expect("acquire should succeed");
        arena.release(tokens).expect("release should succeed");

        let (_, tokens) = arena.acquire(&mut dev, 3, 8).expect("acquire should succeed");
        assert_eq!(arena.allocations(), 3);
        assert_eq!(arena.live(8), 3);
        arena.release(tokens).expect("release should succeed");
        assert_eq!(arena.live(8), 0);
    }

    #[test]
    fn sizes_are_pooled_separately() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::new(10);
        let (_, tokens) = arena.acquire(&mut dev, 2, 8).expect("acquire should succeed");
        arena.release(tokens).expect("release should succeed");
        let (_, tokens) = arena.acquire(&mut dev, 2, 9).expect("acquire should succeed");
        assert_eq!(arena.allocations(), 4);
        arena.release(tokens).expect("release should succeed");
    }

    #[test]
    fn forgotten_release_trips_the_ceiling() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::new(6);
        let mut leaked = Vec::new();
        for _ in 0..2 {
            let (_, tokens) = arena.acquire(&mut dev, 3, 4).expect("acquire should succeed");
            leaked.push(tokens);
        }
        let err = arena
            .acquire(&mut dev, 3, 4)
            .expect_err("ceiling should be enforced");
        assert!(matches!(err, SolverError::BufferLeak { len: 4, max: 6, .. }));
        assert_eq!(arena.allocations(), 6);

        // Other sizes are counted on their own.
        let (_, tokens) = arena.acquire(&mut dev, 3, 5).expect("acquire should succeed");
        arena.release(tokens).expect("release should succeed");
    }

    #[test]
    fn tokens_from_another_arena_are_rejected() {
        let mut dev = HostDevice::new();
        let mut a = BufferArena::new(10);
        let mut b = BufferArena::new(10);
        let (_, tokens) = a.acquire(&mut dev, 1, 4).expect("acquire should succeed");
        let err = b.release(tokens).expect_err("foreign tokens must be rejected");
        assert!(matches!(err, SolverError::ForeignBuffer));
        assert_eq!(b.pooled(4), 0);
    }

    #[test]
    fn tokens_from_before_release_all_are_stale() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::new(10);
        let (_, tokens) = arena.acquire(&mut dev, 2, 4).expect("acquire should succeed");
        arena.release_all(&mut dev);
        assert_eq!(dev.live_allocations(), 0);
        let err = arena.release(tokens).expect_err("stale tokens must be rejected");
        assert!(matches!(err, SolverError::StaleBuffer));
    }

    #[test]
    fn zero_sized_requests_are_contract_errors() {
        let mut dev = HostDevice::new();
        let mut arena = BufferArena::default();
        assert!(matches!(
            arena.acquire(&mut dev, 0, 4),
            Err(SolverError::InvalidBufferShape { ncomp: 0, len: 4 })
        ));
        assert!(matches!(
            arena.acquire(&mut dev, 3, 0),
            Err(SolverError::InvalidBufferShape { ncomp: 3, len: 0 })
        ));
        assert_eq!(dev.allocations(), 0);
    }
}
