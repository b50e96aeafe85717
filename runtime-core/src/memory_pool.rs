// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size block pools for event payload allocation.
//!
//! Grounded on `original_source/components/system/private/memory_pool.h`:
//! several pools of fixed block size, smallest-fit selection, heap fallback
//! on exhaustion or oversized requests, and a magic-word header that lets
//! `free` tell a pool-owned block from a heap-owned one without the caller
//! having to remember which allocator produced it.
//!
//! The public surface is safe: [`PoolAllocator::alloc`] returns an
//! [`Allocation`], an RAII guard that derefs to `[u8]` and returns its block
//! to the originating pool (or drops its heap buffer) automatically. This is
//! the natural Rust translation of the source's explicit `alloc`/`free`
//! pair — ownership replaces the manual call, the way a trait object
//! replaces a raw function pointer elsewhere in this crate (`spec.md`
//! design note on dynamic dispatch, generalized to allocation).

use std::ptr::NonNull;
use std::sync::Mutex;

use counters::Count;

/// Cross-pool allocation events, counted globally in addition to the
/// per-pool [`PoolStats`] above (`SPEC_FULL.md` §B — useful for noticing a
/// heap-fallback rate rising across the whole allocator, not just one pool).
#[derive(Debug, Clone, Copy, Count)]
pub enum AllocEvent {
    PoolHit,
    HeapFallback,
}

/// Magic word stamped into every pool-owned block's header. Chosen as a
/// non-zero, non-trivial pattern so a stray zeroed buffer never validates.
const BLOCK_MAGIC: u32 = 0xB10C_FEED;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    pool_id: u8,
}

const HEADER_LEN: usize = std::mem::size_of::<BlockHeader>();

struct PoolInner {
    /// Backing storage: `block_count` blocks of `HEADER_LEN + block_size`
    /// bytes each.
    storage: Box<[u8]>,
    block_size: usize,
    block_count: usize,
    /// Stack of free block indices. Using an explicit stack rather than a
    /// list threaded through the block memory keeps the unsafe surface
    /// small; the header is still written into each block so `free` can
    /// validate a foreign pointer without consulting this stack.
    free_indices: Vec<u32>,
    stats: PoolStatsInner,
}

#[derive(Default, Clone, Copy)]
struct PoolStatsInner {
    lifetime_allocs: u64,
    lifetime_frees: u64,
    allocation_failures: u64,
    high_water_mark: usize,
}

/// Point-in-time statistics for one pool, from `spec.md` §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub lifetime_allocs: u64,
    pub lifetime_frees: u64,
    pub allocation_failures: u64,
    pub high_water_mark: usize,
}

struct Pool {
    id: u8,
    inner: Mutex<PoolInner>,
}

impl Pool {
    fn new(id: u8, block_size: usize, block_count: usize) -> Self {
        let stride = HEADER_LEN + block_size;
        let storage = vec![0u8; stride * block_count].into_boxed_slice();
        let free_indices = (0..block_count as u32).rev().collect();
        Self {
            id,
            inner: Mutex::new(PoolInner {
                storage,
                block_size,
                block_count,
                free_indices,
                stats: PoolStatsInner::default(),
            }),
        }
    }

    fn stride(block_size: usize) -> usize {
        HEADER_LEN + block_size
    }

    /// Allocates one block, writing a valid header, and returns a pointer
    /// to the payload region (just past the header).
    fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.free_indices.pop() else {
            inner.stats.allocation_failures += 1;
            return None;
        };
        let stride = Self::stride(inner.block_size);
        let offset = index as usize * stride;

        // SAFETY: `offset` is within `storage` because `index <
        // block_count` and `storage.len() == block_count * stride`.
        unsafe {
            let block_ptr = inner.storage.as_mut_ptr().add(offset);
            let header = block_ptr as *mut BlockHeader;
            header.write(BlockHeader {
                magic: BLOCK_MAGIC,
                pool_id: self.id,
            });
            let payload = NonNull::new_unchecked(block_ptr.add(HEADER_LEN));
            inner.stats.lifetime_allocs += 1;
            let used = inner.block_count - inner.free_indices.len();
            if used > inner.stats.high_water_mark {
                inner.stats.high_water_mark = used;
            }
            Some(payload)
        }
    }

    /// Attempts to recognize `ptr` as one of this pool's blocks and return
    /// it to the free list. Returns `false` (without side effects) if the
    /// pointer does not validate, so the caller can fall through to a heap
    /// free.
    fn try_free(&self, ptr: NonNull<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let stride = Self::stride(inner.block_size);
        let base = inner.storage.as_ptr() as usize;
        let extent = inner.storage.len();
        let candidate = ptr.as_ptr() as usize;

        let Some(header_addr) = candidate.checked_sub(HEADER_LEN) else {
            return false;
        };
        if header_addr < base || header_addr >= base + extent {
            return false;
        }
        let relative = header_addr - base;
        if relative % stride != 0 {
            return false;
        }
        let index = (relative / stride) as u32;

        // SAFETY: `header_addr` was just bounds- and alignment-checked
        // against this pool's storage extent.
        let header = unsafe { &mut *(header_addr as *mut BlockHeader) };
        if header.magic != BLOCK_MAGIC || header.pool_id != self.id {
            return false;
        }

        // Clear the magic so a second `try_free` on the same pointer (a
        // double free) is rejected here rather than corrupting the free
        // list by pushing the same index twice.
        header.magic = 0;
        inner.free_indices.push(index);
        inner.stats.lifetime_frees += 1;
        true
    }

    fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let used = inner.block_count - inner.free_indices.len();
        PoolStats {
            block_size: inner.block_size,
            capacity: inner.block_count,
            used,
            free: inner.free_indices.len(),
            lifetime_allocs: inner.stats.lifetime_allocs,
            lifetime_frees: inner.stats.lifetime_frees,
            allocation_failures: inner.stats.allocation_failures,
            high_water_mark: inner.stats.high_water_mark,
        }
    }
}

/// An owned allocation produced by [`PoolAllocator::alloc`].
///
/// Derefs to `[u8]`/`&mut [u8]`. Returned to its originating pool (or simply
/// dropped, if heap-sourced) when this value is dropped.
pub struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

enum Origin {
    Pool { allocator: *const PoolAllocator, pool_index: usize },
    Heap,
}

// SAFETY: `Allocation` owns its bytes exclusively; the raw pointer it holds
// is never aliased. The `PoolAllocator` it may point back into outlives
// every `Allocation` it hands out because callers are expected to drop
// allocations before dropping the allocator (the runtime itself always
// does, since the bus holds both with the same lifetime).
unsafe impl Send for Allocation {}

impl std::ops::Deref for Allocation {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` points at `len` initialized bytes for the lifetime
        // of this `Allocation`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for Allocation {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`; `Allocation` has unique ownership.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Origin::Pool { allocator, pool_index } = self.origin {
            // SAFETY: the allocator is kept alive by the runtime for at
            // least as long as any `Allocation` it produced (see the
            // `Send` safety comment above).
            let allocator = unsafe { &*allocator };
            let freed = allocator.pools[pool_index].try_free(self.ptr);
            debug_assert!(freed, "pool allocation freed through the wrong pool");
        }
        // Heap-origin bytes were allocated as a `Vec<u8>`; reconstruct and
        // drop it here since `Allocation` only stores the raw parts.
        if matches!(self.origin, Origin::Heap) {
            // SAFETY: constructed from `Vec::into_raw_parts`-equivalent in
            // `PoolAllocator::alloc`'s heap-fallback branch, with matching
            // length and capacity.
            unsafe {
                drop(Vec::from_raw_parts(self.ptr.as_ptr(), self.len, self.len));
            }
        }
    }
}

/// Owns a fixed set of pools, keyed by ascending block size, with heap
/// fallback. See `spec.md` §4.1 for the full contract.
pub struct PoolAllocator {
    pools: Vec<Pool>,
    event_counts: AllocEventCounts,
}

impl PoolAllocator {
    pub fn new(block_sizes: &[usize], block_counts: &[usize]) -> Self {
        assert_eq!(block_sizes.len(), block_counts.len());
        let mut sizes: Vec<(usize, usize)> =
            block_sizes.iter().copied().zip(block_counts.iter().copied()).collect();
        sizes.sort_unstable_by_key(|(size, _)| *size);
        let pools = sizes
            .into_iter()
            .enumerate()
            .map(|(id, (size, count))| Pool::new(id as u8, size, count))
            .collect();
        Self { pools, event_counts: AllocEvent::NEW_COUNTERS }
    }

    /// Allocates `len` bytes: from the smallest pool whose block size is
    /// `>= len`, or from the heap if that pool is empty or `len` exceeds
    /// every pool's block size.
    pub fn alloc(&self, len: usize) -> Allocation {
        if let Some(pool_index) = self.pools.iter().position(|p| {
            let cap = p.inner.lock().unwrap().block_size;
            cap >= len
        }) {
            if let Some(ptr) = self.pools[pool_index].alloc() {
                AllocEvent::PoolHit.count(&self.event_counts);
                return Allocation {
                    ptr,
                    len,
                    origin: Origin::Pool { allocator: self as *const _, pool_index },
                };
            }
        }
        AllocEvent::HeapFallback.count(&self.event_counts);
        self.alloc_heap(len)
    }

    fn alloc_heap(&self, len: usize) -> Allocation {
        let mut buf = vec![0u8; len];
        let ptr = NonNull::new(buf.as_mut_ptr()).expect("Vec::as_mut_ptr is never null");
        std::mem::forget(buf);
        Allocation { ptr, len, origin: Origin::Heap }
    }

    /// Statistics for each configured pool, smallest block size first.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(Pool::stats).collect()
    }

    pub fn stats_for(&self, pool_index: usize) -> Option<PoolStats> {
        self.pools.get(pool_index).map(Pool::stats)
    }

    /// Cross-pool hit/heap-fallback totals, distinct from the per-pool
    /// breakdown in [`Self::stats`].
    pub fn event_counts(&self) -> &AllocEventCounts {
        &self.event_counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator() -> PoolAllocator {
        PoolAllocator::new(&[64, 128], &[2, 1])
    }

    #[test]
    fn allocates_from_smallest_fitting_pool() {
        let pool = small_allocator();
        let a = pool.alloc(10);
        assert_eq!(a.len(), 10);
        let stats = pool.stats();
        assert_eq!(stats[0].used, 1);
        assert_eq!(stats[1].used, 0);
    }

    #[test]
    fn falls_back_to_heap_when_exhausted() {
        let pool = small_allocator();
        let _a = pool.alloc(10);
        let _b = pool.alloc(10);
        // Both 64-byte blocks are now in use; a third request of the same
        // size must fall back to the heap rather than fail.
        let c = pool.alloc(10);
        assert_eq!(c.len(), 10);
        let stats = pool.stats();
        assert_eq!(stats[0].used, 2);
        assert_eq!(stats[0].allocation_failures, 1);
    }

    #[test]
    fn falls_back_to_heap_for_oversized_request() {
        let pool = small_allocator();
        let big = pool.alloc(4096);
        assert_eq!(big.len(), 4096);
        let stats = pool.stats();
        assert_eq!(stats[0].used, 0);
        assert_eq!(stats[1].used, 0);
    }

    #[test]
    fn drop_returns_block_to_pool() {
        let pool = small_allocator();
        {
            let _a = pool.alloc(10);
            assert_eq!(pool.stats()[0].used, 1);
        }
        assert_eq!(pool.stats()[0].used, 0);
        assert_eq!(pool.stats()[0].lifetime_frees, 1);
    }

    #[test]
    fn double_free_is_rejected_by_header_validation() {
        let pool = small_allocator();
        // Bypass the `Allocation` RAII wrapper (which would free on drop)
        // to drive the pool's raw alloc/free pair directly.
        let a = pool.pools[0].alloc().expect("pool has free blocks");
        assert!(pool.pools[0].try_free(a));
        // Second attempt on the same pointer must not re-admit the block:
        // the magic word was cleared by the first `try_free`.
        assert!(!pool.pools[0].try_free(a));
        assert_eq!(pool.stats()[0].free, 2);
    }

    #[test]
    fn write_through_deref_mut_is_visible_after_free_and_realloc() {
        let pool = small_allocator();
        let mut a = pool.alloc(4);
        a.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&*a, &[1, 2, 3, 4]);
    }

    #[test]
    fn event_counts_track_pool_hits_and_heap_fallbacks() {
        use std::sync::atomic::Ordering;

        let pool = small_allocator();
        let _a = pool.alloc(10);
        let _b = pool.alloc(4096);
        let counts = pool.event_counts();
        assert_eq!(counts.PoolHit.load(Ordering::Relaxed), 1);
        assert_eq!(counts.HeapFallback.load(Ordering::Relaxed), 1);
    }
}
